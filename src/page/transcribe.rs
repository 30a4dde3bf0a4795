use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;

/// Turns a downloaded media file into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, path: &Path) -> Result<String>;
}

/// OpenAI-compatible `/audio/transcriptions` client.
pub struct WhisperTranscriber {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl WhisperTranscriber {
    pub fn new(client: Client, api_base: &str, api_key: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: "whisper-1".to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime.essence_str())?;
        let form = Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.api_base))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("Transcription request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Transcription failed with {}: {}", status, body);
        }
        let parsed: TranscriptionResponse = response
            .json()
            .await
            .context("Transcription response was not JSON")?;
        Ok(parsed.text)
    }
}

/// Used when no API key is configured.
pub struct DisabledTranscriber;

#[async_trait]
impl Transcriber for DisabledTranscriber {
    async fn transcribe(&self, path: &Path) -> Result<String> {
        Ok(format!(
            "[not transcribed: no transcription API key configured; the file is at {}]",
            path.display()
        ))
    }
}

/// The form transcripts take in a page context.
pub fn label_transcript(source_url: &str, text: &str) -> String {
    format!("Transcription of {}:\n{}", source_url, text.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_transcriber_explains_itself() {
        let text = DisabledTranscriber
            .transcribe(Path::new("/tmp/clip.mp3"))
            .await
            .unwrap();
        assert!(text.contains("not transcribed"));
        assert!(text.contains("/tmp/clip.mp3"));
    }

    #[tokio::test]
    async fn test_whisper_missing_file_is_error() {
        let t = WhisperTranscriber::new(Client::new(), "http://127.0.0.1:9/v1/", "k");
        assert_eq!(t.api_base, "http://127.0.0.1:9/v1");
        assert!(t.transcribe(Path::new("/definitely/missing.mp3")).await.is_err());
    }

    #[test]
    fn test_label_transcript() {
        assert_eq!(
            label_transcript("https://q/a.mp3", " hello \n"),
            "Transcription of https://q/a.mp3:\nhello"
        );
    }
}
