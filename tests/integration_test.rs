use anyhow::Result;
use bytes::Bytes;
use std::time::Duration;
use storefront_assistant::config::Config;
use storefront_assistant::context::{ContextBuilder, CONTEXT_BLOCK_COUNT};
use storefront_assistant::render::render_message;
use storefront_assistant::state::{
    Assembler, AssemblerState, AssemblerUpdate, TurnOutcome, TRANSPORT_ERROR_MESSAGE,
};
use storefront_assistant::types::{DataSnapshot, Viewer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn config(api_key: Option<&str>, api_url: &str) -> Config {
    Config {
        api_key: api_key.map(str::to_string),
        model: "mistral-large-latest".to_string(),
        api_url: api_url.to_string(),
        backend_url: "http://localhost:3001".to_string(),
        currency: "CLP".to_string(),
        idle_timeout: Duration::from_secs(30),
        viewer: Viewer::customer(Some("7".to_string())),
    }
}

fn delta_line(text: &str) -> String {
    let chunk = serde_json::json!({ "choices": [{ "delta": { "content": text } }] });
    format!("data: {chunk}\n")
}

async fn assemble(chunks: Vec<Vec<u8>>) -> (TurnOutcome, Vec<AssemblerUpdate>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let body = futures::stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<_, anyhow::Error>(Bytes::from(chunk))),
    );
    let request = async move { Ok::<_, anyhow::Error>(body) };

    let outcome = Assembler::new(Duration::from_secs(5), CancellationToken::new())
        .run(request, &tx)
        .await;
    drop(tx);

    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    (outcome, updates)
}

#[test]
fn test_config_validation_rejects_remote_api_without_key() {
    let config = config(None, "https://api.mistral.ai/v1/chat/completions");

    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_allows_local_endpoint_without_api_key() {
    let config = config(None, "http://localhost:8000/v1/chat/completions");

    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation_rejects_non_http_backend() {
    let mut config = config(Some("key"), "https://api.mistral.ai/v1/chat/completions");
    config.backend_url = "localhost:3001".to_string();

    assert!(config.validate().is_err());
}

#[tokio::test]
async fn test_two_chunk_reply_publishes_each_rendered_prefix() {
    let chunks = vec![
        b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n".to_vec(),
        b"data: {\"choices\":[{\"delta\":{\"content\":\"lo **world**\"}}]}\n".to_vec(),
    ];

    let (outcome, updates) = assemble(chunks).await;

    let deltas: Vec<&AssemblerUpdate> = updates
        .iter()
        .filter(|u| matches!(u, AssemblerUpdate::Delta(_)))
        .collect();
    assert_eq!(
        deltas,
        vec![
            &AssemblerUpdate::Delta("Hel".to_string()),
            &AssemblerUpdate::Delta("Hello <b>world</b>".to_string()),
        ]
    );
    assert_eq!(outcome.state(), AssemblerState::Completed);
    assert_eq!(outcome.rendered(), "Hello <b>world</b>");
}

#[tokio::test]
async fn test_final_render_is_independent_of_chunk_boundaries() {
    let mut transcript = String::new();
    for piece in [
        "¡Hola **Ana**!\n",
        "Tu pedido está en [Mis compras](/mis-compras)",
        " y el mate en https://tienda.example/producto/4.\n",
        "Total: 9.990 CLP ñ🧉",
    ] {
        transcript.push_str(&delta_line(piece));
    }
    transcript.push_str("data: [DONE]\n");
    let bytes = transcript.into_bytes();

    let (reference, _) = assemble(vec![bytes.clone()]).await;
    assert_eq!(reference.state(), AssemblerState::Completed);
    let expected = render_message(
        "¡Hola **Ana**!\nTu pedido está en [Mis compras](/mis-compras) y el mate en \
https://tienda.example/producto/4.\nTotal: 9.990 CLP ñ🧉",
    );
    assert_eq!(reference.rendered(), expected);

    for size in [1, 2, 3, 5, 7, 16, 64, 255] {
        let chunks: Vec<Vec<u8>> = bytes.chunks(size).map(<[u8]>::to_vec).collect();
        let (outcome, _) = assemble(chunks).await;
        assert_eq!(outcome.state(), AssemblerState::Completed, "chunk size {size}");
        assert_eq!(outcome.rendered(), expected, "chunk size {size}");
    }
}

#[tokio::test]
async fn test_malformed_frame_mid_stream_does_not_abort_reply() {
    let chunks = vec![
        delta_line("uno ").into_bytes(),
        b"data: {\"choices\": [oops\n".to_vec(),
        delta_line("dos").into_bytes(),
    ];

    let (outcome, updates) = assemble(chunks).await;

    assert_eq!(outcome.state(), AssemblerState::Completed);
    assert_eq!(outcome.rendered(), "uno dos");
    assert_eq!(
        updates.last(),
        Some(&AssemblerUpdate::Complete("uno dos".to_string()))
    );
}

#[tokio::test]
async fn test_provider_error_stops_parsing_and_is_not_accumulated() {
    let chunks = vec![
        delta_line("parcial").into_bytes(),
        b"error: {\"message\":\"quota exceeded\"}\n".to_vec(),
        delta_line(" ignorado").into_bytes(),
    ];

    let (outcome, updates) = assemble(chunks).await;

    match &outcome {
        TurnOutcome::Failed { error, partial } => {
            assert_eq!(error.user_message(), "quota exceeded");
            assert_eq!(partial, "parcial");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(
        updates,
        vec![
            AssemblerUpdate::Delta("parcial".to_string()),
            AssemblerUpdate::Error("quota exceeded".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_transport_error_mid_stream_shows_fixed_message() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let body = futures::stream::iter(vec![
        Ok(Bytes::from(delta_line("Hola"))),
        Err(anyhow::anyhow!("connection reset")),
    ]);
    let request = async move { Result::<_>::Ok(body) };

    let outcome = Assembler::new(Duration::from_secs(5), CancellationToken::new())
        .run(request, &tx)
        .await;
    drop(tx);

    assert_eq!(outcome.state(), AssemblerState::Failed);
    assert_eq!(rx.recv().await, Some(AssemblerUpdate::Delta("Hola".to_string())));
    assert_eq!(
        rx.recv().await,
        Some(AssemblerUpdate::Error(TRANSPORT_ERROR_MESSAGE.to_string()))
    );
    assert_eq!(rx.recv().await, None);
}

#[test]
fn test_admin_and_customer_context_share_schema() {
    let snapshot = DataSnapshot::default();
    let builder = ContextBuilder::new(&snapshot, "CLP");

    let admin = builder.build(&Viewer::admin(None), "ventas del mes");
    let customer = builder.build(&Viewer::customer(Some("7".to_string())), "mi carrito");

    assert_eq!(admin.len(), CONTEXT_BLOCK_COUNT);
    assert_eq!(customer.len(), CONTEXT_BLOCK_COUNT);
    for (a, c) in admin.iter().zip(&customer) {
        assert_eq!(a.role, c.role);
    }
}
