use crate::api::ApiClient;
use crate::context::{own_account, owned_by};
use crate::types::{ContextBlock, DataSnapshot};
use crate::util::normalize_id;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Upper bound on ids returned when the model cannot be used.
pub const MAX_FALLBACK_RECOMMENDATIONS: usize = 8;

const RECOMMENDER_INSTRUCTION: &str = "You are an intelligent product recommendation assistant.";
const REPLY_FORMAT_INSTRUCTION: &str = "IMPORTANT: reply ONLY with a JSON array of recommended \
product ids and nothing else. Format: [\"id1\", \"id2\", \"id3\"]";
const RECOMMENDATION_REQUEST: &str = "Based on the user's purchase history and cart, recommend \
products they may be interested in. If there is not enough history, recommend popular or \
featured products.";

/// Picks catalog products for a customer from their carts and orders.
pub struct Recommender {
    client: Arc<ApiClient>,
}

impl Recommender {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    /// Returns recommended product ids.
    ///
    /// Falls back to the first catalog products when the customer has no
    /// history, when the completion call fails, or when the reply is unusable.
    pub async fn recommend(&self, snapshot: &DataSnapshot, viewer_id: Option<&str>) -> Vec<String> {
        let carts = snapshot.carts.as_ref().map(|c| owned_by(c, viewer_id));
        let orders = snapshot.orders.as_ref().map(|o| owned_by(o, viewer_id));
        if is_empty_collection(carts.as_ref()) && is_empty_collection(orders.as_ref()) {
            tracing::debug!(viewer = viewer_id.unwrap_or("anonymous"), "no purchase history, using fallback recommendations");
            return fallback_ids(snapshot);
        }

        let account = snapshot
            .users
            .as_ref()
            .and_then(|users| own_account(users, viewer_id).as_array()?.first().cloned())
            .unwrap_or_else(|| Value::Object(Default::default()));
        let blocks = recommendation_context(snapshot, carts.as_ref(), orders.as_ref(), &account);

        let reply = match self.client.complete(&blocks).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "recommendation request failed");
                return fallback_ids(snapshot);
            }
        };

        let catalog: BTreeSet<String> = snapshot.product_ids().into_iter().collect();
        match parse_recommended_ids(&reply) {
            Some(ids) => {
                let known: Vec<String> = ids
                    .into_iter()
                    .filter(|id| catalog.is_empty() || catalog.contains(id))
                    .collect();
                if known.is_empty() {
                    fallback_ids(snapshot)
                } else {
                    known
                }
            }
            None => {
                tracing::warn!(reply = %reply, "recommendation reply was not a JSON id array");
                fallback_ids(snapshot)
            }
        }
    }
}

fn recommendation_context(
    snapshot: &DataSnapshot,
    carts: Option<&Value>,
    orders: Option<&Value>,
    account: &Value,
) -> Vec<ContextBlock> {
    let encode = |value: Option<&Value>| {
        value
            .map(Value::to_string)
            .unwrap_or_else(|| "[]".to_string())
    };
    vec![
        ContextBlock::system(RECOMMENDER_INSTRUCTION),
        ContextBlock::system(format!(
            "Available products: {}",
            encode(snapshot.products.as_ref())
        )),
        ContextBlock::system(format!("The user's carts: {}", encode(carts))),
        ContextBlock::system(format!("The user's purchase orders: {}", encode(orders))),
        ContextBlock::system(format!("The user's account: {account}")),
        ContextBlock::system(REPLY_FORMAT_INSTRUCTION),
        ContextBlock::user(RECOMMENDATION_REQUEST),
    ]
}

/// Extracts the id array from a model reply, tolerating prose or code fences
/// around it. Numeric and string ids are both accepted.
pub fn parse_recommended_ids(reply: &str) -> Option<Vec<String>> {
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    if end < start {
        return None;
    }

    let values: Vec<Value> = serde_json::from_str(&reply[start..=end]).ok()?;
    let mut seen = BTreeSet::new();
    let ids = values
        .iter()
        .filter_map(normalize_id)
        .filter(|id| seen.insert(id.clone()))
        .collect();
    Some(ids)
}

fn fallback_ids(snapshot: &DataSnapshot) -> Vec<String> {
    snapshot
        .product_ids()
        .into_iter()
        .take(MAX_FALLBACK_RECOMMENDATIONS)
        .collect()
}

fn is_empty_collection(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_array)
        .map_or(true, |records| records.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock_client::MockApiClient;
    use serde_json::json;

    fn snapshot() -> DataSnapshot {
        let products: Vec<Value> = (1..=10)
            .map(|id| json!({ "id_producto": id, "nombre": format!("Producto {id}") }))
            .collect();
        DataSnapshot {
            products: Some(Value::Array(products)),
            categories: None,
            carts: Some(json!([{ "id_carrito": 1, "usuario": { "id_usuario": 7 } }])),
            orders: Some(json!([{ "id_orden": 2, "usuario": { "id_usuario": "9" } }])),
            users: Some(json!([{ "id_usuario": 7, "nombre": "Ana" }])),
        }
    }

    fn recommender(mock: &MockApiClient) -> Recommender {
        Recommender::new(Arc::new(ApiClient::new_mock(Arc::new(mock.clone()))))
    }

    #[test]
    fn test_parse_recommended_ids_handles_fences_and_numbers() {
        let reply = "Here you go:\n```json\n[\"4\", 9, \"4\", null]\n```";
        assert_eq!(
            parse_recommended_ids(reply),
            Some(vec!["4".to_string(), "9".to_string()])
        );
        assert_eq!(parse_recommended_ids("no list here"), None);
        assert_eq!(parse_recommended_ids("] backwards ["), None);
    }

    #[tokio::test]
    async fn test_recommend_uses_model_reply_for_customer_with_history() {
        let mock = MockApiClient::new(vec![vec!["[\"3\", 5, \"99\"]".to_string()]]);
        let ids = recommender(&mock).recommend(&snapshot(), Some("7")).await;

        assert_eq!(ids, vec!["3", "5"]);
        let seen = mock.seen_completions();
        assert_eq!(seen.len(), 1);
        let content = |index: usize| seen[0][index]["content"].as_str().unwrap_or_default().to_string();
        assert!(content(2).contains("\"id_carrito\":1"));
        assert!(content(4).contains("Ana"));
    }

    #[tokio::test]
    async fn test_recommend_without_history_skips_model() {
        let mock = MockApiClient::new(vec![]);
        let ids = recommender(&mock).recommend(&snapshot(), Some("42")).await;

        assert_eq!(ids.len(), MAX_FALLBACK_RECOMMENDATIONS);
        assert_eq!(ids[0], "1");
        assert!(mock.seen_completions().is_empty());
    }

    #[tokio::test]
    async fn test_recommend_falls_back_on_unusable_reply() {
        let mock = MockApiClient::new(vec![vec!["I recommend the mate!".to_string()]]);
        let ids = recommender(&mock).recommend(&snapshot(), Some("9")).await;

        assert_eq!(ids, fallback_ids(&snapshot()));
    }

    #[tokio::test]
    async fn test_recommend_falls_back_on_request_failure() {
        let mock = MockApiClient::new(vec![]);
        let ids = recommender(&mock).recommend(&snapshot(), Some("7")).await;

        assert_eq!(ids.len(), MAX_FALLBACK_RECOMMENDATIONS);
    }
}
