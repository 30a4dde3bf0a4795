//! Posting answers to the quiz server.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{COOKIE, REFERER, SET_COOKIE};
use tracing::{debug, info};

use crate::chain::{Cookie, SubmissionPayload, cookie_header};
use crate::errors::SubmitError;

/// The unparsed reply of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawSubmission {
    pub body: String,
    /// Cookies the server set on the response; they travel to the next link.
    pub set_cookies: Vec<Cookie>,
}

#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(
        &self,
        url: &str,
        payload: &SubmissionPayload,
        cookies: &[Cookie],
        referer: &str,
    ) -> Result<RawSubmission, SubmitError>;
}

pub struct HttpSubmitter {
    client: Client,
}

impl HttpSubmitter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Submitter for HttpSubmitter {
    async fn submit(
        &self,
        url: &str,
        payload: &SubmissionPayload,
        cookies: &[Cookie],
        referer: &str,
    ) -> Result<RawSubmission, SubmitError> {
        info!(url, answer = %payload.answer, "submitting answer");
        let mut request = self.client.post(url).header(REFERER, referer).json(payload);
        if let Some(header) = cookie_header(cookies) {
            request = request.header(COOKIE, header);
        }

        let transport = |source| SubmitError::Transport {
            url: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(Cookie::from_set_cookie)
            .collect();
        let body = response.text().await.map_err(transport)?;
        debug!(url, %status, body = %body, "submission response");

        Ok(RawSubmission { body, set_cookies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_transport_failure_is_submit_error() {
        let submitter = HttpSubmitter::new(Client::new());
        let payload = SubmissionPayload {
            email: "a@b.c".into(),
            secret: "s".into(),
            url: "http://127.0.0.1:9/quiz".into(),
            answer: json!(1),
        };
        let err = submitter
            .submit("http://127.0.0.1:9/submit", &payload, &[], "http://127.0.0.1:9/quiz")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("127.0.0.1:9/submit"));
    }
}
