//! Polling a stand-in Ollama server through the local-provider facade

use std::sync::Arc;
use std::time::Duration;

use logos_adapters_ollama::OllamaClient;
use logos_core::{
    Capacity, DeploymentId, DeploymentMetadata, LocalFacade, LocalProviderConfig,
    SchedulingDataInterface,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const PS_BODY: &str = r#"{"models":[
    {"name":"llama3.2:3b","size_vram":8589934592,"expires_at":"2999-01-01T00:00:00Z"},
    {"name":"llama3.1:70b","size_vram":42949672960,"expires_at":"2999-01-01T00:00:00Z"}
]}"#;

/// Serve `body` with `status` to every connection
async fn serve(status: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn test_facade_polls_ollama() {
    let base_url = serve("200 OK", PS_BODY).await;
    let client = Arc::new(OllamaClient::new(&base_url, "ollama-test").unwrap());

    let facade = LocalFacade::new(
        LocalProviderConfig::new(1, "ollama-test")
            .with_base_url(base_url)
            .with_total_vram_mb(65536)
            .with_refresh_interval(Duration::from_secs(5)),
    )
    .with_source(client);
    facade
        .register_model(10, DeploymentMetadata::local(DeploymentId::new(10, 1), "llama3.2:3b"))
        .await
        .unwrap();

    let status = facade.get_model_status(10).await.unwrap();
    assert!(status.is_loaded);
    assert_eq!(status.vram_mb, Some(8192));

    let Capacity::Local(capacity) = facade.get_capacity_info(10).await.unwrap() else {
        panic!("expected local capacity");
    };
    assert_eq!(capacity.available_vram_mb, 65536 - 8192 - 40960);
    assert_eq!(capacity.loaded_models.len(), 2);
}

#[tokio::test]
async fn test_server_error_is_poll_failure() {
    let base_url = serve("500 Internal Server Error", r#"{"error":"boom"}"#).await;
    let client = OllamaClient::new(&base_url, "ollama-test").unwrap();

    let err = client.running_models().await.unwrap_err();
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn test_failed_poll_keeps_model_cold() {
    let base_url = serve("503 Service Unavailable", "").await;
    let client = Arc::new(OllamaClient::new(&base_url, "ollama-test").unwrap());

    let facade = LocalFacade::new(LocalProviderConfig::new(1, "ollama-test").with_total_vram_mb(24576))
        .with_source(client);
    facade
        .register_model(10, DeploymentMetadata::local(DeploymentId::new(10, 1), "llama3.2:3b"))
        .await
        .unwrap();

    // The failure is absorbed; with no snapshot yet the model reads as cold
    let status = facade.get_model_status(10).await.unwrap();
    assert!(!status.is_loaded);
}
