use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Environment;

const TIMEOUT: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = r#"You are an expert Flux image prompt engineer. Optimize prompts following these rules:

1. Use clear, descriptive language with comma-separated keywords
2. Include technical details (lighting, composition, camera settings for photos)
3. Add quality markers: masterpiece, best quality, highly detailed, 8k
4. Match the requested style exactly
5. Suggest optimal negative prompt to avoid common issues
6. Recommend specific settings (sampler, steps, CFG, resolution)

Output format:
OPTIMIZED PROMPT: [detailed comma-separated prompt]

NEGATIVE PROMPT: [things to avoid]

RECOMMENDED SETTINGS:
- Model: [best Flux model for this]
- Sampler: [sampler name]
- Scheduler: [scheduler name]
- Steps: [number]
- CFG: [value]
- Resolution: [width x height]
- LoRAs: [suggested LoRAs if applicable]
"#;

/// Turns a rough idea into a detailed Flux prompt.
#[derive(Parser, Debug)]
pub struct OptimizeOpts {
    /// The prompt idea
    idea: String,

    /// Image style
    #[arg(long, default_value = "photorealistic")]
    style: String,

    /// Model to ask, defaults to the configured optimizer.model
    #[arg(long)]
    model: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_owned(),
            content: content.into(),
        }
    }
}

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: Message,
}

#[derive(Deserialize, Debug, Default, Clone, Copy)]
pub struct Usage {
    #[serde(default)]
    pub total_tokens: u64,
}

/// The optimized prompt and what it cost.
#[derive(Debug)]
pub struct Optimized {
    pub content: String,
    pub usage: Usage,
}

/// The user message sent for an idea.
pub(crate) fn user_message(idea: &str, style: &str) -> String {
    format!(
        "Style: {}\nOriginal idea: {}\n\nOptimize this for Flux image generation.",
        style, idea
    )
}

/// Asks a chat completions endpoint to rewrite `idea`.
pub async fn optimize(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    model: &str,
    idea: &str,
    style: &str,
) -> anyhow::Result<Optimized> {
    let request = ChatRequest {
        model,
        messages: vec![
            Message::new("system", SYSTEM_PROMPT),
            Message::new("user", user_message(idea, style)),
        ],
    };
    debug!(endpoint, model, "requesting prompt optimization");
    let response = client
        .post(endpoint)
        .bearer_auth(api_key)
        .header("X-Title", "Flux Prompt Optimizer")
        .timeout(TIMEOUT)
        .json(&request)
        .send()
        .await
        .with_context(|| format!("Request to {} failed", endpoint))?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(anyhow!("got error code: {}, message text: {}", status, text));
    }
    let response: ChatResponse = response.json().await.context("Invalid response")?;
    let content = response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .context("Response contained no choices")?;
    Ok(Optimized {
        content,
        usage: response.usage.unwrap_or_default(),
    })
}

pub async fn exec(env: &Environment, opts: OptimizeOpts) -> anyhow::Result<()> {
    let config = env.config();
    let api_key = config
        .openrouter_api_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .context("OPENROUTER_API_KEY is not set, add it to the environment or .env")?;
    let model = opts.model.as_deref().unwrap_or(&config.optimizer.model);

    eprintln!("Optimizing prompt with {}", model);
    let optimized = optimize(
        &reqwest::Client::new(),
        &config.optimizer.endpoint,
        api_key,
        model,
        &opts.idea,
        &opts.style,
    )
    .await?;

    println!("{}", optimized.content);
    println!();
    println!("Tokens used: {}", optimized.usage.total_tokens);
    Ok(())
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use serde_json::json;

    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_optimize() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({
                "model": "test/model",
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": user_message("a cat on a roof", "anime")}
                ]
            })))
            .with_status(200)
            .with_body(
                json!({
                    "choices": [{"message": {"role": "assistant", "content": "OPTIMIZED PROMPT: cat"}}],
                    "usage": {"prompt_tokens": 200, "completion_tokens": 50, "total_tokens": 250}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let optimized = optimize(
            &reqwest::Client::new(),
            &format!("{}/api/v1/chat/completions", server.url()),
            "sk-test",
            "test/model",
            "a cat on a roof",
            "anime",
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(optimized.content, "OPTIMIZED PROMPT: cat");
        assert_eq!(optimized.usage.total_tokens, 250);
    }

    #[tokio::test]
    async fn test_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat")
            .with_status(401)
            .with_body("No auth credentials found")
            .create_async()
            .await;

        let err = optimize(
            &reqwest::Client::new(),
            &format!("{}/chat", server.url()),
            "bad",
            "m",
            "idea",
            "style",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("No auth credentials found"));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let env = Environment::new(Config::default(), "http://localhost:8188".to_string());
        let opts = OptimizeOpts {
            idea: "idea".to_string(),
            style: "photorealistic".to_string(),
            model: None,
        };
        assert!(exec(&env, opts).await.is_err());
    }
}
