//! Request Builder - template-driven outbound HTTP dispatch
//!
//! Turns a channel (or AI channel) template plus a message into a concrete
//! HTTP request:
//! - substitution environment: template `placeholders` + message-derived
//!   `title`/`content`/`url` (and `prompt` for AI)
//! - `content` is capped to the template's `max_length` codepoints before
//!   substitution
//! - `{name}` placeholders resolve single-pass, left-to-right, non-recursive;
//!   unknown names resolve to the empty string
//! - GET/DELETE carry params as query parameters and no body; POST/PUT encode
//!   the body per the template's content type (form/json/xml)
//! - one shared client per proxy configuration

use std::time::Duration;

use dashmap::DashMap;
use indexmap::IndexMap;
use reqwest::Client;
use tracing::{debug, info, warn};

use mp_common::{
    classify_status, AiChannelTemplate, BodyEncoding, ChannelTemplate, DispatchOutcome,
    DispatchResult, HttpMethod, Message, ProxyConfig,
};

/// Substitution environment: placeholder name -> literal value.
pub type SubstEnv = IndexMap<String, String>;

/// Configuration for the HTTP dispatcher
#[derive(Debug, Clone)]
pub struct HttpDispatcherConfig {
    /// Total request deadline
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
}

impl Default for HttpDispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Error from a bounded URL fetch.
#[derive(Debug)]
pub struct UrlFetchError {
    pub transient: bool,
    pub message: String,
}

impl std::fmt::Display for UrlFetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for UrlFetchError {}

/// Template-driven HTTP dispatcher with a client per proxy configuration.
pub struct HttpDispatcher {
    config: HttpDispatcherConfig,
    clients: DashMap<String, Client>,
}

impl HttpDispatcher {
    pub fn new(config: HttpDispatcherConfig) -> Self {
        info!(
            timeout_secs = config.timeout.as_secs(),
            "HttpDispatcher initialized"
        );
        Self {
            config,
            clients: DashMap::new(),
        }
    }

    /// Get or build the shared client for a proxy configuration.
    fn client_for(&self, proxy: Option<&ProxyConfig>) -> Result<Client, String> {
        let key = proxy
            .filter(|p| !p.is_empty())
            .map(|p| p.cache_key())
            .unwrap_or_default();

        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(self.config.timeout)
            .connect_timeout(self.config.connect_timeout);

        if let Some(proxy) = proxy {
            if let Some(http) = &proxy.http {
                builder = builder
                    .proxy(reqwest::Proxy::http(http).map_err(|e| format!("bad http proxy: {}", e))?);
            }
            if let Some(https) = &proxy.https {
                builder = builder.proxy(
                    reqwest::Proxy::https(https).map_err(|e| format!("bad https proxy: {}", e))?,
                );
            }
        }

        let client = builder
            .build()
            .map_err(|e| format!("client build failed: {}", e))?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Dispatch a message through a channel template.
    pub async fn dispatch_channel(
        &self,
        channel: &ChannelTemplate,
        message: &Message,
    ) -> DispatchOutcome {
        let env = build_env(channel.placeholders.as_ref(), message, channel.max_length, None);
        let url = substitute(&channel.api_url, &env);

        let client = match self.client_for(channel.proxy.as_ref()) {
            Ok(client) => client,
            Err(err) => return DispatchOutcome::permanent(None, err),
        };

        let request = assemble_request(
            &client,
            channel.method,
            &url,
            channel.content_type,
            &channel.params,
            channel.headers.as_ref(),
            &env,
        );

        debug!(
            channel_id = %channel.id,
            message_id = %message.id,
            method = %channel.method,
            "Dispatching channel request"
        );
        self.execute(request).await
    }

    /// Dispatch a message through an AI channel template. Always POST/JSON;
    /// when the template has no `params` the conventional chat-completion
    /// body is sent.
    pub async fn dispatch_ai(
        &self,
        ai: &AiChannelTemplate,
        message: &Message,
        prompt: &str,
    ) -> DispatchOutcome {
        let env = build_env(
            ai.placeholders.as_ref(),
            message,
            mp_common::DEFAULT_MAX_LENGTH,
            Some(prompt),
        );
        let url = substitute(&ai.api_url, &env);

        let client = match self.client_for(ai.proxy.as_ref()) {
            Ok(client) => client,
            Err(err) => return DispatchOutcome::permanent(None, err),
        };

        let body = match &ai.params {
            Some(params) => {
                let mut object = serde_json::Map::new();
                for (key, value) in params {
                    object.insert(key.clone(), substitute_value(value, &env));
                }
                serde_json::Value::Object(object)
            }
            None => serde_json::json!({
                "model": ai.model,
                "messages": [
                    {"role": "system", "content": env.get("prompt").cloned().unwrap_or_default()},
                    {"role": "user", "content": env.get("content").cloned().unwrap_or_default()},
                ],
            }),
        };

        let mut request = client.post(&url).json(&body);
        let headers = explicit_headers(ai.headers.as_ref(), &env);
        if !headers.is_empty() {
            request = request.headers(headers);
        }

        debug!(ai_channel_id = %ai.id, message_id = %message.id, "Dispatching AI request");
        self.execute(request).await
    }

    /// Fetch a URL, keeping at most `max_bytes` of the body. Bytes past the
    /// cap are discarded, not buffered.
    pub async fn fetch_url(&self, url: &str, max_bytes: usize) -> Result<String, UrlFetchError> {
        let client = self.client_for(None).map_err(|message| UrlFetchError {
            transient: false,
            message,
        })?;

        let mut response = client.get(url).send().await.map_err(request_fetch_error)?;

        let status = response.status().as_u16();
        match classify_status(status) {
            DispatchResult::Success => {}
            DispatchResult::Transient => {
                return Err(UrlFetchError {
                    transient: true,
                    message: format!("HTTP {}", status),
                })
            }
            DispatchResult::Permanent => {
                return Err(UrlFetchError {
                    transient: false,
                    message: format!("HTTP {}", status),
                })
            }
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(request_fetch_error)? {
            if buffer.len() < max_bytes {
                let room = max_bytes - buffer.len();
                buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            if buffer.len() >= max_bytes {
                truncated = true;
            }
        }
        if truncated {
            warn!(url = %url, max_bytes, "URL content truncated at cap");
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> DispatchOutcome {
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match classify_status(status) {
                    DispatchResult::Success => {
                        let body = response.text().await.ok();
                        DispatchOutcome::success(status, body)
                    }
                    DispatchResult::Transient => {
                        DispatchOutcome::transient(Some(status), format!("HTTP {}", status))
                    }
                    DispatchResult::Permanent => {
                        DispatchOutcome::permanent(Some(status), format!("HTTP {}", status))
                    }
                }
            }
            Err(err) => {
                if err.is_timeout() {
                    DispatchOutcome::transient(None, "request timeout".to_string())
                } else if err.is_builder() {
                    DispatchOutcome::permanent(None, format!("invalid request: {}", err))
                } else {
                    DispatchOutcome::transient(None, format!("connection error: {}", err))
                }
            }
        }
    }
}

fn request_fetch_error(err: reqwest::Error) -> UrlFetchError {
    UrlFetchError {
        transient: !err.is_builder(),
        message: err.to_string(),
    }
}

/// Build the substitution environment for a template and message.
///
/// Template placeholders come first so later message bindings shadow
/// identically-named constants. Absent message fields bind to empty string;
/// `content` is capped to `max_length` codepoints.
pub fn build_env(
    placeholders: Option<&IndexMap<String, String>>,
    message: &Message,
    max_length: u32,
    prompt: Option<&str>,
) -> SubstEnv {
    let mut env = SubstEnv::new();
    if let Some(placeholders) = placeholders {
        for (name, value) in placeholders {
            env.insert(name.clone(), value.clone());
        }
    }

    let content = message.content.as_deref().unwrap_or("");
    let capped: String = content.chars().take(max_length as usize).collect();

    env.insert("title".to_string(), message.title.clone().unwrap_or_default());
    env.insert("content".to_string(), capped);
    env.insert("url".to_string(), message.url.clone().unwrap_or_default());
    if let Some(prompt) = prompt {
        env.insert("prompt".to_string(), prompt.to_string());
    }
    env
}

/// Single-pass, left-to-right `{name}` substitution. Substituted text is not
/// rescanned; unknown names resolve to the empty string; an unmatched `{`
/// passes through literally.
pub fn substitute(input: &str, env: &SubstEnv) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(|c| c == '{' || c == '}') {
            Some(pos) if after.as_bytes()[pos] == b'}' => {
                let name = &after[..pos];
                out.push_str(env.get(name).map(String::as_str).unwrap_or(""));
                rest = &after[pos + 1..];
            }
            Some(pos) => {
                // Inner '{' before any '}': the first brace is literal
                out.push('{');
                out.push_str(&after[..pos]);
                rest = &after[pos..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Substitute every string inside a JSON value (nested mappings preserved).
pub fn substitute_value(value: &serde_json::Value, env: &SubstEnv) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(substitute(s, env)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| substitute_value(v, env)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Flatten a params value to its string form for query/form/xml encodings.
fn scalar_string(value: &serde_json::Value, env: &SubstEnv) -> String {
    match value {
        serde_json::Value::String(s) => substitute(s, env),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            substitute(&value.to_string(), env)
        }
        other => other.to_string(),
    }
}

fn assemble_request(
    client: &Client,
    method: HttpMethod,
    url: &str,
    encoding: BodyEncoding,
    params: &IndexMap<String, serde_json::Value>,
    headers: Option<&IndexMap<String, String>>,
    env: &SubstEnv,
) -> reqwest::RequestBuilder {
    let mut request = if method.sends_body() {
        let base = match method {
            HttpMethod::Post => client.post(url),
            _ => client.put(url),
        };
        match encoding {
            BodyEncoding::Form => {
                let pairs: Vec<(String, String)> = params
                    .iter()
                    .map(|(k, v)| (k.clone(), scalar_string(v, env)))
                    .collect();
                base.form(&pairs)
            }
            BodyEncoding::Json => {
                let mut object = serde_json::Map::new();
                for (key, value) in params {
                    object.insert(key.clone(), substitute_value(value, env));
                }
                base.json(&serde_json::Value::Object(object))
            }
            BodyEncoding::Xml => {
                let body = encode_xml(params, env);
                base.header("Content-Type", BodyEncoding::Xml.content_type())
                    .body(body)
            }
        }
    } else {
        let pairs: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), scalar_string(v, env)))
            .collect();
        let base = match method {
            HttpMethod::Get => client.get(url),
            _ => client.delete(url),
        };
        base.query(&pairs)
    };

    // Explicit headers are substituted and override the encoding defaults
    let explicit = explicit_headers(headers, env);
    if !explicit.is_empty() {
        request = request.headers(explicit);
    }

    request
}

/// Substitute and validate explicit template headers. Applying these via
/// `RequestBuilder::headers` replaces any default set by the body encoding.
fn explicit_headers(
    headers: Option<&IndexMap<String, String>>,
    env: &SubstEnv,
) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    if let Some(headers) = headers {
        for (name, value) in headers {
            let substituted = substitute(value, env);
            match (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(&substituted),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid template header"),
            }
        }
    }
    map
}

/// `<root><key>value</key>…</root>` with scalar values only.
fn encode_xml(params: &IndexMap<String, serde_json::Value>, env: &SubstEnv) -> String {
    let mut body = String::from("<root>");
    for (key, value) in params {
        body.push('<');
        body.push_str(key);
        body.push('>');
        body.push_str(&escape_xml(&scalar_string(value, env)));
        body.push_str("</");
        body.push_str(key);
        body.push('>');
    }
    body.push_str("</root>");
    body
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use indexmap::indexmap;
    use mp_common::EntityStatus;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_message(title: Option<&str>, content: Option<&str>, url: Option<&str>) -> Message {
        Message {
            id: "m-1".to_string(),
            api_token_id: "t-1".to_string(),
            title: title.map(String::from),
            content: content.map(String::from),
            url: url.map(String::from),
            url_content: None,
            file_storage: None,
            view_token: "view-1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_channel(api_url: &str, method: HttpMethod, encoding: BodyEncoding) -> ChannelTemplate {
        ChannelTemplate {
            id: "c-1".to_string(),
            name: "test".to_string(),
            api_url: api_url.to_string(),
            method,
            content_type: encoding,
            params: IndexMap::new(),
            headers: None,
            placeholders: None,
            proxy: None,
            max_length: 2000,
            status: EntityStatus::Enabled,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_substitute_basics() {
        let env: SubstEnv = indexmap! {
            "title".to_string() => "hello".to_string(),
            "chat_id".to_string() => "42".to_string(),
        };
        assert_eq!(substitute("{title}", &env), "hello");
        assert_eq!(substitute("id={chat_id}&t={title}", &env), "id=42&t=hello");
        assert_eq!(substitute("no placeholders", &env), "no placeholders");
        assert_eq!(substitute("{unknown}", &env), "");
        assert_eq!(substitute("{title", &env), "{title");
        assert_eq!(substitute("}{title}", &env), "}hello");
    }

    #[test]
    fn test_substitute_is_not_recursive() {
        let env: SubstEnv = indexmap! {
            "a".to_string() => "{b}".to_string(),
            "b".to_string() => "secret".to_string(),
        };
        // Substituted text is not rescanned
        assert_eq!(substitute("{a}", &env), "{b}");
    }

    #[test]
    fn test_substitute_nested_brace() {
        let env: SubstEnv = indexmap! { "b".to_string() => "x".to_string() };
        assert_eq!(substitute("{a{b}c}", &env), "{axc}");
    }

    #[test]
    fn test_build_env_caps_content_by_codepoints() {
        let message = test_message(Some("t"), Some("héllo-wörld"), None);
        let env = build_env(None, &message, 7, None);
        assert_eq!(env.get("content").unwrap(), "héllo-w");
        assert_eq!(env.get("title").unwrap(), "t");
        assert_eq!(env.get("url").unwrap(), "");
    }

    #[test]
    fn test_message_bindings_shadow_placeholders() {
        let placeholders = indexmap! { "title".to_string() => "constant".to_string() };
        let message = test_message(Some("actual"), None, None);
        let env = build_env(Some(&placeholders), &message, 2000, None);
        assert_eq!(env.get("title").unwrap(), "actual");
    }

    #[test]
    fn test_encode_xml_escapes() {
        let env = SubstEnv::new();
        let params = indexmap! {
            "body".to_string() => serde_json::json!("a<b&c>d"),
        };
        assert_eq!(
            encode_xml(&params, &env),
            "<root><body>a&lt;b&amp;c&gt;d</body></root>"
        );
    }

    #[tokio::test]
    async fn test_post_json_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/push"))
            .and(body_string_contains("\"t\":\"hi\""))
            .and(body_string_contains("\"b\":\"hello-worl\""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut channel = test_channel(
            &format!("{}/push", server.uri()),
            HttpMethod::Post,
            BodyEncoding::Json,
        );
        channel.max_length = 10;
        channel.params = indexmap! {
            "t".to_string() => serde_json::json!("{title}"),
            "b".to_string() => serde_json::json!("{content}"),
        };

        let message = test_message(Some("hi"), Some("hello-world-long"), None);
        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::default());
        let outcome = dispatcher.dispatch_channel(&channel, &message).await;

        assert_eq!(outcome.result, DispatchResult::Success);
        assert_eq!(outcome.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_get_dispatch_uses_query_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notify"))
            .and(query_param("text", "ping"))
            .and(query_param("key", "k-123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut channel = test_channel(
            &format!("{}/notify", server.uri()),
            HttpMethod::Get,
            BodyEncoding::Form,
        );
        channel.params = indexmap! {
            "text".to_string() => serde_json::json!("{content}"),
            "key".to_string() => serde_json::json!("{api_key}"),
        };
        channel.placeholders = Some(indexmap! {
            "api_key".to_string() => "k-123".to_string(),
        });

        let message = test_message(None, Some("ping"), None);
        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::default());
        let outcome = dispatcher.dispatch_channel(&channel, &message).await;

        assert_eq!(outcome.result, DispatchResult::Success);
    }

    #[tokio::test]
    async fn test_explicit_content_type_overrides_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("Content-Type", "application/json; charset=utf-8"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut channel = test_channel(
            &format!("{}/hook", server.uri()),
            HttpMethod::Post,
            BodyEncoding::Json,
        );
        channel.headers = Some(indexmap! {
            "Content-Type".to_string() => "application/json; charset=utf-8".to_string(),
        });

        let message = test_message(Some("t"), None, None);
        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::default());
        let outcome = dispatcher.dispatch_channel(&channel, &message).await;
        assert_eq!(outcome.result, DispatchResult::Success);
    }

    #[tokio::test]
    async fn test_xml_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xml"))
            .and(header("Content-Type", "application/xml"))
            .and(body_string_contains("<root><msg>hi</msg></root>"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut channel = test_channel(
            &format!("{}/xml", server.uri()),
            HttpMethod::Post,
            BodyEncoding::Xml,
        );
        channel.params = indexmap! { "msg".to_string() => serde_json::json!("{title}") };

        let message = test_message(Some("hi"), None, None);
        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::default());
        let outcome = dispatcher.dispatch_channel(&channel, &message).await;
        assert_eq!(outcome.result, DispatchResult::Success);
    }

    #[tokio::test]
    async fn test_transient_and_permanent_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/unavailable"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::default());
        let message = test_message(Some("t"), None, None);

        let channel = test_channel(
            &format!("{}/unavailable", server.uri()),
            HttpMethod::Post,
            BodyEncoding::Json,
        );
        let outcome = dispatcher.dispatch_channel(&channel, &message).await;
        assert_eq!(outcome.result, DispatchResult::Transient);
        assert_eq!(outcome.error_message.as_deref(), Some("HTTP 503"));

        let channel = test_channel(
            &format!("{}/gone", server.uri()),
            HttpMethod::Post,
            BodyEncoding::Json,
        );
        let outcome = dispatcher.dispatch_channel(&channel, &message).await;
        assert_eq!(outcome.result, DispatchResult::Permanent);
    }

    #[tokio::test]
    async fn test_connection_error_is_transient() {
        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::default());
        let message = test_message(Some("t"), None, None);
        let channel = test_channel(
            "http://127.0.0.1:59999/unreachable",
            HttpMethod::Post,
            BodyEncoding::Json,
        );
        let outcome = dispatcher.dispatch_channel(&channel, &message).await;
        assert_eq!(outcome.result, DispatchResult::Transient);
    }

    #[tokio::test]
    async fn test_ai_default_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("\"model\":\"gpt-4o-mini\""))
            .and(body_string_contains("Summarize."))
            .and(body_string_contains("the text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "summary"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ai = AiChannelTemplate {
            id: "a-1".to_string(),
            name: "ai".to_string(),
            api_url: format!("{}/v1/chat/completions", server.uri()),
            model: "gpt-4o-mini".to_string(),
            params: None,
            headers: Some(indexmap! {
                "Authorization".to_string() => "Bearer {api_key}".to_string(),
            }),
            placeholders: Some(indexmap! {
                "api_key".to_string() => "sk-test".to_string(),
            }),
            prompt: Some("Summarize.".to_string()),
            proxy: None,
            status: EntityStatus::Enabled,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let message = test_message(None, Some("the text"), None);
        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::default());
        let outcome = dispatcher.dispatch_ai(&ai, &message, "Summarize.").await;

        assert_eq!(outcome.result, DispatchResult::Success);
        assert!(outcome.body.unwrap().contains("summary"));
    }

    #[tokio::test]
    async fn test_fetch_url_caps_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("abcdefghij"))
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::default());
        let text = dispatcher
            .fetch_url(&format!("{}/page", server.uri()), 4)
            .await
            .unwrap();
        assert_eq!(text, "abcd");
    }

    #[tokio::test]
    async fn test_fetch_url_error_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::default());

        let err = dispatcher
            .fetch_url(&format!("{}/busy", server.uri()), 1024)
            .await
            .unwrap_err();
        assert!(err.transient);

        let err = dispatcher
            .fetch_url(&format!("{}/missing", server.uri()), 1024)
            .await
            .unwrap_err();
        assert!(!err.transient);
    }
}
