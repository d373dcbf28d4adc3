use std::env;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::OracleError;

pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct Description {
    pub text: String,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait DescriptionOracle: Send + Sync {
    async fn describe(&self, image: &Path, app: &str) -> Result<Description, OracleError>;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError>;
}

#[async_trait]
pub trait VisualJudge: Send + Sync {
    async fn same_state(&self, a: &Path, b: &Path) -> Result<bool, OracleError>;
}

#[derive(Clone)]
pub struct Oracles {
    describer: Arc<dyn DescriptionOracle>,
    judge: Arc<dyn VisualJudge>,
    timeout: Duration,
}

impl Oracles {
    pub fn new(describer: Arc<dyn DescriptionOracle>, judge: Arc<dyn VisualJudge>) -> Self {
        Self { describer, judge, timeout: DEFAULT_ORACLE_TIMEOUT }
    }

    pub fn shared<T>(service: Arc<T>) -> Self
    where
        T: DescriptionOracle + VisualJudge + 'static,
    {
        Self::new(service.clone(), service)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn describe(&self, image: &Path, app: &str) -> Result<Description, OracleError> {
        self.bounded(self.describer.describe(image, app)).await
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        self.bounded(self.describer.embed(text)).await
    }

    pub async fn same_state(&self, a: &Path, b: &Path) -> Result<bool, OracleError> {
        self.bounded(self.judge.same_state(a, b)).await
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, OracleError>>) -> Result<T, OracleError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(OracleError::Timeout(self.timeout)),
        }
    }
}

// ========================= HTTP-backed oracle =========================

#[derive(Clone, Debug)]
pub struct VlmConfig {
    pub api_base: String,        // e.g. "https://api.openai.com/v1"
    pub api_key: String,         // env OPENAI_API_KEY
    pub chat_model: String,      // vision-capable chat model
    pub embedding_model: String, // text embedding model
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            chat_model: env::var("SCREENGRAPH_VLM_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            embedding_model: env::var("SCREENGRAPH_EMBED_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".into()),
        }
    }
}

const DESCRIBE_PROMPT: &str = "You are a GUI agent. In one sentence, say what page this phone \
screenshot shows, then briefly summarise its layout and purpose. Ignore anything that changes \
with time or content refreshes.";

const SAME_STATE_PROMPT: &str = "You are a GUI agent. Ignoring changes caused by time or refreshed \
recommendations, decide whether the two screenshots are the same page state.\n\
1. All phone home screens count as the same page.\n\
2. Only changes caused by an action matter.\n\
3. Different selected navigation tabs mean different pages.\n\
4. If an action is needed to turn one screenshot into the other, they are different states.";

#[derive(Clone)]
pub struct VlmClient {
    http: Client,
    cfg: VlmConfig,
}

impl VlmClient {
    pub fn new(cfg: VlmConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    async fn post(&self, route: &str, body: Value) -> Result<Value> {
        let url = format!("{}/{}", self.cfg.api_base.trim_end_matches('/'), route);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("model endpoint error {}: {}", status, text);
        }
        serde_json::from_str(&text).context("failed to parse model response JSON")
    }

    async fn chat(&self, system: &str, user: Vec<Value>) -> Result<String> {
        let req = json!({
            "model": self.cfg.chat_model,
            "temperature": 0.0,
            "messages": [
                { "role": "system", "content": [{ "type": "text", "text": system }] },
                { "role": "user", "content": user }
            ]
        });
        let v = self.post("chat/completions", req).await?;
        v.pointer("/choices/0/message/content")
            .and_then(|x| x.as_str())
            .map(|s| s.trim().to_string())
            .context("missing choices[0].message.content")
    }
}

async fn image_part(path: &Path) -> Result<Value, OracleError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| OracleError::Image {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mime = match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    Ok(json!({
        "type": "image_url",
        "image_url": { "url": format!("data:{};base64,{}", mime, STANDARD.encode(bytes)) }
    }))
}

fn transport(e: anyhow::Error) -> OracleError {
    OracleError::Transport(format!("{:#}", e))
}

// Only the part before any "reason" section counts; any negation means "different".
pub fn parse_same_state(reply: &str) -> bool {
    let lower = reply.to_lowercase();
    let cut = ["reason", "原因"].iter().filter_map(|m| lower.find(m)).min();
    let answer = match cut {
        Some(i) => &lower[..i],
        None => lower.as_str(),
    };
    let negated_word = answer
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| matches!(w, "no" | "not" | "different"));
    let negated_cjk = ["不是", "否", "不属于", "不同"].iter().any(|m| answer.contains(m));
    !(negated_word || negated_cjk)
}

#[async_trait]
impl DescriptionOracle for VlmClient {
    async fn describe(&self, image: &Path, app: &str) -> Result<Description, OracleError> {
        let img = image_part(image).await?;
        let user = vec![
            json!({ "type": "text", "text": format!("App: {}", app) }),
            img,
            json!({ "type": "text", "text": "Answer:" }),
        ];
        let text = self.chat(DESCRIBE_PROMPT, user).await.map_err(transport)?;
        debug!(image = %image.display(), description = %text, "described screenshot");
        let embedding = self.embed(&text).await?;
        Ok(Description { text, embedding })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        let req = json!({ "model": self.cfg.embedding_model, "input": text });
        let v = self.post("embeddings", req).await.map_err(transport)?;
        let arr = v
            .pointer("/data/0/embedding")
            .and_then(|x| x.as_array())
            .ok_or_else(|| OracleError::Malformed("missing data[0].embedding".into()))?;
        arr.iter()
            .map(|x| {
                x.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| OracleError::Malformed("non-numeric embedding value".into()))
            })
            .collect()
    }
}

#[async_trait]
impl VisualJudge for VlmClient {
    async fn same_state(&self, a: &Path, b: &Path) -> Result<bool, OracleError> {
        let user = vec![
            image_part(a).await?,
            image_part(b).await?,
            json!({ "type": "text", "text": "Answer: yes/no (yes means the same page state)\nReason:" }),
        ];
        let reply = self.chat(SAME_STATE_PROMPT, user).await.map_err(transport)?;
        let same = parse_same_state(&reply);
        debug!(a = %a.display(), b = %b.display(), same, reply = %reply, "visual judgment");
        Ok(same)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // descriptions keyed by image path, fixed visual verdict, counted visual calls
    #[derive(Default)]
    pub struct StubOracle {
        pub descriptions: HashMap<PathBuf, Description>,
        pub failing: Vec<PathBuf>,
        pub same: bool,
        pub visual_calls: AtomicUsize,
    }

    impl StubOracle {
        pub fn with(mut self, path: &str, text: &str, embedding: Vec<f32>) -> Self {
            self.descriptions
                .insert(PathBuf::from(path), Description { text: text.into(), embedding });
            self
        }

        pub fn judging(mut self, same: bool) -> Self {
            self.same = same;
            self
        }

        pub fn failing_on(mut self, path: &str) -> Self {
            self.failing.push(PathBuf::from(path));
            self
        }

        pub fn visual_calls(&self) -> usize {
            self.visual_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DescriptionOracle for StubOracle {
        async fn describe(&self, image: &Path, _app: &str) -> Result<Description, OracleError> {
            if self.failing.iter().any(|p| p == image) {
                return Err(OracleError::Transport("stub failure".into()));
            }
            self.descriptions
                .get(image)
                .cloned()
                .ok_or_else(|| OracleError::Image { path: image.to_path_buf(), reason: "unknown".into() })
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
            self.descriptions
                .values()
                .find(|d| d.text == text)
                .map(|d| d.embedding.clone())
                .ok_or_else(|| OracleError::Malformed(format!("no embedding for {text}")))
        }
    }

    #[async_trait]
    impl VisualJudge for StubOracle {
        async fn same_state(&self, _a: &Path, _b: &Path) -> Result<bool, OracleError> {
            self.visual_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.same)
        }
    }

    struct SlowJudge;

    #[async_trait]
    impl VisualJudge for SlowJudge {
        async fn same_state(&self, _a: &Path, _b: &Path) -> Result<bool, OracleError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn slow_oracle_calls_time_out() {
        let oracles = Oracles::new(Arc::new(StubOracle::default()), Arc::new(SlowJudge))
            .with_timeout(Duration::from_millis(20));
        let err = oracles
            .same_state(Path::new("a.png"), Path::new("b.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Timeout(_)));
    }

    #[test]
    fn verdict_parsing_reads_only_the_answer() {
        assert!(parse_same_state("Yes.\nReason: the tab is different from before"));
        assert!(!parse_same_state("No\nReason: same layout"));
        assert!(!parse_same_state("These are different pages."));
        assert!(!parse_same_state("否\n原因：导航栏不同"));
        assert!(parse_same_state("是\n原因：只有推荐内容不同"));
    }

    #[test]
    fn client_requires_api_key() {
        let cfg = VlmConfig { api_key: String::new(), ..VlmConfig::default() };
        assert!(VlmClient::new(cfg).is_err());
    }
}
