use anyhow::{bail, Result};
use ktulhuEmbed::client::EmbeddingClient;
use std::env;

/// Embeds each CLI argument through a running service and prints one JSON line per text.
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let texts: Vec<String> = env::args().skip(1).collect();
    if texts.is_empty() {
        bail!("usage: embed_cli <text> [<text> ...]  (EMBEDDING_SERVICE_URL must be set)");
    }

    let client = EmbeddingClient::from_env();
    let health = client.health().await?;
    eprintln!("🟦 {} → model {}", client.base_url(), health.model);

    let vectors = client.embed_many(&texts).await?;
    for (text, vector) in texts.iter().zip(vectors) {
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        println!(
            "{}",
            serde_json::json!({ "text": text, "dims": vector.len(), "norm": norm, "embedding": vector })
        );
    }
    Ok(())
}
