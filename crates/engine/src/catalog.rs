use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

/// Accounting mapping for one supplier.
#[derive(Debug, Clone, Deserialize)]
pub struct SupplierMapping {
    pub ledger_account: String,
    /// Default counterpart location when the line itself carries none.
    #[serde(default)]
    pub location: Option<String>,
}

/// Accounting mapping for one article, with its classification axis values.
#[derive(Debug, Clone, Deserialize)]
pub struct ArticleMapping {
    pub account: String,
    /// Axis name -> value. Must cover every axis the catalog declares.
    #[serde(default)]
    pub axes: BTreeMap<String, String>,
}

/// Read-only supplier/location/article mapping catalog, injected into the
/// validator. The business taxonomy behind it is external lookup data.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingCatalog {
    #[serde(default)]
    pub suppliers: HashMap<String, SupplierMapping>,
    /// Location code -> counterpart account.
    #[serde(default)]
    pub locations: HashMap<String, String>,
    #[serde(default)]
    pub articles: HashMap<String, ArticleMapping>,
    /// Classification axes every article must carry a value for.
    #[serde(default)]
    pub axes: Vec<String>,
}

impl MappingCatalog {
    pub fn supplier(&self, supplier_id: &str) -> Option<&SupplierMapping> {
        self.suppliers.get(supplier_id)
    }

    /// Resolve the counterpart account for a line: the line's own location
    /// code when set, otherwise the supplier's default location.
    pub fn counterpart_account(
        &self,
        supplier_id: &str,
        line_location: Option<&str>,
    ) -> Option<&str> {
        let code = line_location.or_else(|| {
            self.suppliers
                .get(supplier_id)
                .and_then(|s| s.location.as_deref())
        })?;
        self.locations.get(code).map(String::as_str)
    }

    pub fn article(&self, article_code: &str) -> Option<&ArticleMapping> {
        self.articles.get(article_code)
    }

    /// Whether `article` carries a non-empty value for every declared axis.
    pub fn axes_complete(&self, article: &ArticleMapping) -> bool {
        self.axes
            .iter()
            .all(|axis| article.axes.get(axis).is_some_and(|v| !v.is_empty()))
    }
}
