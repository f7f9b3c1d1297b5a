//! Audio download from plain URLs and the `WhatsApp` media endpoint

use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{AudioClip, MAX_AUDIO_BYTES, MediaError, normalize_mime};
use crate::ingest::{AudioRef, AudioSource};

/// Media metadata returned by `GET /{media_id}`
#[derive(Debug, Deserialize)]
struct MediaMetadata {
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

/// Downloads voice notes
pub struct MediaFetcher {
    client: Client,
    /// Graph API root including version, e.g. `https://graph.facebook.com/v21.0`
    graph_url: String,
    access_token: Option<SecretString>,
    max_bytes: usize,
}

impl MediaFetcher {
    /// Create a fetcher
    ///
    /// `access_token` is required for `WhatsApp` media ids; plain URLs are
    /// fetched without credentials.
    #[must_use]
    pub fn new(client: Client, graph_url: impl Into<String>, access_token: Option<SecretString>) -> Self {
        Self {
            client,
            graph_url: graph_url.into().trim_end_matches('/').to_string(),
            access_token,
            max_bytes: MAX_AUDIO_BYTES,
        }
    }

    /// Override the size limit
    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Download the audio behind a reference
    ///
    /// The MIME type is taken from the reference hint, then the platform
    /// metadata, then the download's `Content-Type`.
    ///
    /// # Errors
    ///
    /// Returns `Missing` if the media no longer resolves, `TooLarge` over the
    /// size limit, and `Unavailable` for network or upstream failures
    pub async fn fetch(&self, audio: &AudioRef) -> Result<AudioClip, MediaError> {
        match &audio.source {
            AudioSource::Url { url } => {
                let response = self.get(url, false).await?;
                self.read_clip(response, audio.mime_type.as_deref()).await
            }
            AudioSource::WhatsappMedia { media_id } => {
                let metadata = self.resolve_media(media_id).await?;
                if let Some(size) = metadata.file_size {
                    let size = usize::try_from(size).unwrap_or(usize::MAX);
                    if size > self.max_bytes {
                        return Err(MediaError::TooLarge {
                            size,
                            limit: self.max_bytes,
                        });
                    }
                }

                let hint = audio.mime_type.as_deref().or(metadata.mime_type.as_deref());
                let response = self.get(&metadata.url, true).await?;
                self.read_clip(response, hint).await
            }
        }
    }

    async fn resolve_media(&self, media_id: &str) -> Result<MediaMetadata, MediaError> {
        let url = format!("{}/{media_id}", self.graph_url);
        let response = self.get(&url, true).await?;
        response
            .json()
            .await
            .map_err(|e| MediaError::Unavailable(format!("media metadata: {e}")))
    }

    async fn get(&self, url: &str, authenticated: bool) -> Result<Response, MediaError> {
        let mut request = self.client.get(url);
        if authenticated {
            let Some(token) = &self.access_token else {
                return Err(MediaError::Unavailable(
                    "WhatsApp access token not configured".to_string(),
                ));
            };
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| MediaError::Unavailable(format!("media request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(MediaError::Missing(format!("{status}")));
        }
        if !status.is_success() {
            return Err(MediaError::Unavailable(format!("media request returned {status}")));
        }

        Ok(response)
    }

    async fn read_clip(&self, response: Response, hint: Option<&str>) -> Result<AudioClip, MediaError> {
        if let Some(length) = response.content_length() {
            let size = usize::try_from(length).unwrap_or(usize::MAX);
            if size > self.max_bytes {
                return Err(MediaError::TooLarge {
                    size,
                    limit: self.max_bytes,
                });
            }
        }

        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| MediaError::Unavailable(format!("media download failed: {e}")))?;

        if bytes.len() > self.max_bytes {
            return Err(MediaError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        if bytes.is_empty() {
            return Err(MediaError::Missing("empty download".to_string()));
        }

        let mime_type = hint
            .map(String::from)
            .or(header_mime)
            .map(|m| normalize_mime(&m))
            .unwrap_or_default();

        tracing::debug!(bytes = bytes.len(), mime_type = %mime_type, "downloaded audio");

        Ok(AudioClip {
            bytes: bytes.to_vec(),
            mime_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::header;
    use axum::routing::get;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn url_ref(url: String, mime: Option<&str>) -> AudioRef {
        AudioRef {
            source: AudioSource::Url { url },
            mime_type: mime.map(String::from),
        }
    }

    #[tokio::test]
    async fn fetches_plain_url_with_content_type() {
        let base = serve(Router::new().route(
            "/note.ogg",
            get(|| async { ([(header::CONTENT_TYPE, "audio/ogg; codecs=opus")], vec![1u8, 2, 3]) }),
        ))
        .await;

        let fetcher = MediaFetcher::new(Client::new(), "http://unused", None);
        let clip = fetcher.fetch(&url_ref(format!("{base}/note.ogg"), None)).await.unwrap();
        assert_eq!(clip.bytes, vec![1, 2, 3]);
        assert_eq!(clip.mime_type, "audio/ogg");
    }

    #[tokio::test]
    async fn missing_media_is_reported() {
        let base = serve(Router::new()).await;
        let fetcher = MediaFetcher::new(Client::new(), "http://unused", None);
        let err = fetcher
            .fetch(&url_ref(format!("{base}/gone.ogg"), Some("audio/ogg")))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Missing(_)));
    }

    #[tokio::test]
    async fn oversized_download_is_rejected() {
        let base = serve(Router::new().route("/big", get(|| async { vec![0u8; 64] }))).await;
        let fetcher = MediaFetcher::new(Client::new(), "http://unused", None).with_max_bytes(16);
        let err = fetcher
            .fetch(&url_ref(format!("{base}/big"), Some("audio/ogg")))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::TooLarge { size: 64, limit: 16 }));
    }

    #[tokio::test]
    async fn resolves_whatsapp_media_id() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let download = format!("{base}/download/media-1");

        let router = Router::new()
            .route(
                "/v21.0/media-1",
                get(move || {
                    let download = download.clone();
                    async move {
                        axum::Json(serde_json::json!({
                            "url": download,
                            "mime_type": "audio/ogg; codecs=opus",
                            "file_size": 3
                        }))
                    }
                }),
            )
            .route("/download/media-1", get(|| async { vec![9u8, 9, 9] }));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let fetcher = MediaFetcher::new(
            Client::new(),
            format!("{base}/v21.0"),
            Some(SecretString::from("token".to_string())),
        );
        let clip = fetcher
            .fetch(&AudioRef {
                source: AudioSource::WhatsappMedia {
                    media_id: "media-1".to_string(),
                },
                mime_type: None,
            })
            .await
            .unwrap();
        assert_eq!(clip.bytes, vec![9, 9, 9]);
        assert_eq!(clip.mime_type, "audio/ogg");
    }

    #[tokio::test]
    async fn whatsapp_media_requires_token() {
        let fetcher = MediaFetcher::new(Client::new(), "http://127.0.0.1:9", None);
        let err = fetcher
            .fetch(&AudioRef {
                source: AudioSource::WhatsappMedia {
                    media_id: "m".to_string(),
                },
                mime_type: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Unavailable(_)));
    }
}
