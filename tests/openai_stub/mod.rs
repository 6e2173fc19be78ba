use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::Value;

/// How the stub answers `POST /v1/responses`.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Reviews accept, summaries list themes, everything else echoes the
    /// `BEGIN_INPUT` block with a mode marker.
    Echo,
    /// Every request fails with this status and an OpenAI-style error body.
    Status(u16, String),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub authorization: Option<String>,
    pub body: Value,
}

pub struct OpenAiStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

pub const REVIEW_REPLY: &str =
    "Verdict: accept\nScore: 9\nSuggestions:\n- keep the closing image\n";
pub const SUMMARY_REPLY: &str = "harbour life, weather, duty";

impl OpenAiStub {
    pub fn spawn(behavior: StubBehavior) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start openai stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                if request.method() != &tiny_http::Method::Post || request.url() != "/v1/responses"
                {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let authorization = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.as_str().to_owned());

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }
                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("invalid json").with_status_code(400),
                        );
                        continue;
                    }
                };
                recorded.lock().unwrap().push(RecordedRequest {
                    authorization,
                    body: parsed.clone(),
                });

                if let StubBehavior::Status(status, message) = &behavior {
                    let error = serde_json::json!({ "error": { "message": message } });
                    let _ = request.respond(
                        tiny_http::Response::from_string(error.to_string())
                            .with_status_code(*status),
                    );
                    continue;
                }

                let instructions = parsed
                    .get("instructions")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let Some(prompt) = parsed.get("input").and_then(|v| v.as_str()) else {
                    let _ = request.respond(
                        tiny_http::Response::from_string("missing input").with_status_code(400),
                    );
                    continue;
                };

                let output_text = if prompt.contains("Respond in exactly this format") {
                    REVIEW_REPLY.to_owned()
                } else if instructions.starts_with("Summarize") {
                    SUMMARY_REPLY.to_owned()
                } else {
                    match extract_between(prompt, "BEGIN_INPUT\n", "\nEND_INPUT") {
                        Some(input) => format!("{input}\n\n[stub rewrite]"),
                        None => {
                            let _ = request.respond(
                                tiny_http::Response::from_string("missing input markers")
                                    .with_status_code(400),
                            );
                            continue;
                        }
                    }
                };

                let model = parsed
                    .get("model")
                    .cloned()
                    .unwrap_or(Value::String("stub-model".to_owned()));
                let response_body = serde_json::json!({
                    "id": "resp_stub",
                    "object": "response",
                    "model": model,
                    "output": [
                        {
                            "type": "message",
                            "role": "assistant",
                            "content": [
                                { "type": "output_text", "text": output_text }
                            ]
                        }
                    ]
                });

                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                let response = tiny_http::Response::from_string(response_body.to_string())
                    .with_status_code(200)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn extract_between<'a>(text: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let start = text.find(begin)? + begin.len();
    let rest = &text[start..];
    let end_rel = rest.find(end)?;
    Some(&rest[..end_rel])
}
