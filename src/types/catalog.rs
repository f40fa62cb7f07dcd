use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ViewerRole {
    Admin,
    #[default]
    Customer,
}

impl ViewerRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" | "administrator" => Some(Self::Admin),
            "customer" | "client" | "user" => Some(Self::Customer),
            _ => None,
        }
    }
}

impl fmt::Display for ViewerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => f.write_str("admin"),
            Self::Customer => f.write_str("customer"),
        }
    }
}

/// The person talking to the assistant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Viewer {
    pub role: ViewerRole,
    pub id: Option<String>,
}

impl Viewer {
    pub fn admin(id: Option<String>) -> Self {
        Self {
            role: ViewerRole::Admin,
            id,
        }
    }

    pub fn customer(id: Option<String>) -> Self {
        Self {
            role: ViewerRole::Customer,
            id,
        }
    }

    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or("anonymous")
    }
}

/// Storefront collections as served by the backend.
///
/// `None` means the collection could not be loaded; it is distinct from an
/// empty array returned by a healthy backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataSnapshot {
    pub products: Option<Value>,
    pub categories: Option<Value>,
    pub carts: Option<Value>,
    pub orders: Option<Value>,
    pub users: Option<Value>,
}

impl DataSnapshot {
    pub fn has_catalog(&self) -> bool {
        self.products.is_some()
    }

    /// Ids of catalog products, in backend order.
    pub fn product_ids(&self) -> Vec<String> {
        self.products
            .as_ref()
            .and_then(Value::as_array)
            .map(|products| {
                products
                    .iter()
                    .filter_map(|product| {
                        product
                            .get("id_producto")
                            .or_else(|| product.get("id"))
                            .and_then(crate::util::normalize_id)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_viewer_role_parse_accepts_aliases() {
        assert_eq!(ViewerRole::parse(" Admin "), Some(ViewerRole::Admin));
        assert_eq!(ViewerRole::parse("client"), Some(ViewerRole::Customer));
        assert_eq!(ViewerRole::parse("guest"), None);
    }

    #[test]
    fn test_product_ids_accepts_both_id_keys() {
        let snapshot = DataSnapshot {
            products: Some(json!([
                { "id_producto": 4, "nombre": "Mate" },
                { "id": "9", "nombre": "Bombilla" },
                { "nombre": "sin id" }
            ])),
            ..DataSnapshot::default()
        };
        assert_eq!(snapshot.product_ids(), vec!["4", "9"]);
    }
}
