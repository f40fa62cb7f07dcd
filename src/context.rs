use crate::types::{ContextBlock, DataSnapshot, Viewer, ViewerRole};
use crate::util::normalize_id;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Number of blocks every call to [`ContextBuilder::build`] returns.
pub const CONTEXT_BLOCK_COUNT: usize = 13;

const ASSISTANT_INSTRUCTION: &str = "You are the virtual shopping assistant of an online store. \
Answer only from the store data provided in this conversation. \
If the data does not contain the answer, say so instead of guessing.";
const OMIT_IDENTIFIERS_INSTRUCTION: &str = "Never show internal database identifiers \
(id_producto, id_usuario, id_carrito, id_orden or similar) in your answers; \
refer to products, orders and people by name, date or description instead. \
Identifiers may only appear inside link URLs.";
const LINK_FORMAT_INSTRUCTION: &str = "When you mention a product, order or page, \
link it with markdown syntax [label](url) using the link templates provided. \
Use relative URLs exactly as given and never invent other routes.";
const ADMIN_ANALYSIS_INSTRUCTION: &str = "The person asking is a store administrator. \
You may analyse all carts, orders and users: summarise sales, best-selling products, \
pending orders, stock concerns and customer activity when asked.";
const CUSTOMER_PRIVACY_INSTRUCTION: &str = "The person asking is a customer. \
Only the customer's own cart, orders and account are included above. \
Never disclose, estimate or discuss data belonging to any other user, \
even if asked directly.";
const ADMIN_LINK_TEMPLATES: &str = "Link templates: product editor /admin/productos/editar/{id_producto}; \
order detail /admin/ordenes/{id_orden}; product list /admin/productos; \
categories /admin/categorias; orders /admin/ordenes.";
const CUSTOMER_LINK_TEMPLATES: &str = "Link templates: product page /producto/{id_producto}; \
store /tienda; cart /carrito; purchase history /mis-compras.";

/// Assembles the ordered context sent with each user question.
///
/// The block schema is fixed: admins and customers receive the same number of
/// blocks in the same order, only the content differs. Missing collections are
/// encoded as the JSON empty string so a cold cache never changes the request
/// shape.
pub struct ContextBuilder<'a> {
    snapshot: &'a DataSnapshot,
    currency: &'a str,
    now: DateTime<Utc>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(snapshot: &'a DataSnapshot, currency: &'a str) -> Self {
        Self {
            snapshot,
            currency,
            now: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn build(&self, viewer: &Viewer, utterance: &str) -> Vec<ContextBlock> {
        let snapshot = self.snapshot;
        let (carts, orders, users) = match viewer.role {
            ViewerRole::Admin => (
                snapshot.carts.clone(),
                snapshot.orders.clone(),
                snapshot.users.clone(),
            ),
            ViewerRole::Customer => {
                let id = viewer.id.as_deref();
                (
                    snapshot.carts.as_ref().map(|c| owned_by(c, id)),
                    snapshot.orders.as_ref().map(|o| owned_by(o, id)),
                    snapshot.users.as_ref().map(|u| own_account(u, id)),
                )
            }
        };
        let (role_instruction, link_templates) = match viewer.role {
            ViewerRole::Admin => (ADMIN_ANALYSIS_INSTRUCTION, ADMIN_LINK_TEMPLATES),
            ViewerRole::Customer => (CUSTOMER_PRIVACY_INSTRUCTION, CUSTOMER_LINK_TEMPLATES),
        };

        vec![
            ContextBlock::system(ASSISTANT_INSTRUCTION),
            data_block("Product catalog", snapshot.products.as_ref()),
            data_block("Product categories", snapshot.categories.as_ref()),
            ContextBlock::system(format!(
                "Current date and time: {}",
                self.now.to_rfc3339_opts(SecondsFormat::Secs, true)
            )),
            ContextBlock::system(format!(
                "All prices are expressed in {}; always state amounts in that currency.",
                self.currency
            )),
            ContextBlock::system(OMIT_IDENTIFIERS_INSTRUCTION),
            ContextBlock::system(LINK_FORMAT_INSTRUCTION),
            data_block("Shopping carts", carts.as_ref()),
            data_block("Purchase orders", orders.as_ref()),
            data_block("User accounts", users.as_ref()),
            ContextBlock::system(role_instruction),
            ContextBlock::system(link_templates),
            ContextBlock::user(format!("[viewer {}] {}", viewer.label(), utterance)),
        ]
    }
}

fn data_block(label: &str, value: Option<&Value>) -> ContextBlock {
    ContextBlock::system(format!("{label} (JSON): {}", encode(value)))
}

fn encode(value: Option<&Value>) -> String {
    match value {
        Some(value) => serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string()),
        None => "\"\"".to_string(),
    }
}

/// Owner of a cart or order: `usuario.id_usuario`, falling back to a
/// top-level `id_usuario`.
pub(crate) fn owner_id(record: &Value) -> Option<String> {
    record
        .get("usuario")
        .and_then(|user| user.get("id_usuario"))
        .or_else(|| record.get("id_usuario"))
        .and_then(normalize_id)
}

/// Records of `collection` whose owner matches `viewer_id`.
pub(crate) fn owned_by(collection: &Value, viewer_id: Option<&str>) -> Value {
    let Some(viewer_id) = viewer_id else {
        return Value::Array(Vec::new());
    };
    let records = collection
        .as_array()
        .map(|records| {
            records
                .iter()
                .filter(|record| owner_id(record).as_deref() == Some(viewer_id))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    Value::Array(records)
}

/// The viewer's own account record, as a zero- or one-element array.
pub(crate) fn own_account(users: &Value, viewer_id: Option<&str>) -> Value {
    let Some(viewer_id) = viewer_id else {
        return Value::Array(Vec::new());
    };
    let account = users.as_array().and_then(|records| {
        records.iter().find(|record| {
            record.get("id_usuario").and_then(normalize_id).as_deref() == Some(viewer_id)
        })
    });
    Value::Array(account.cloned().into_iter().collect())
}
