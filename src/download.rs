use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{app_state::AppError, config, loopback, utils::TempFileHandle};

/// Downloads `url` to a fresh scratch file, observing the 10-minute download timeout
/// and the job's cancellation token. Returns the handle and the number of bytes
/// written, which callers can check against `Content-Length`.
pub async fn download_to_temp(
    http: &reqwest::Client,
    url: &reqwest::Url,
    extension: &str,
    cancel: &CancellationToken,
) -> Result<(TempFileHandle, u64), AppError> {
    let handle = TempFileHandle::new(extension);
    let download = async {
        let response = loopback::get(http, url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(handle.path()).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok::<u64, AppError>(written)
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            handle.cleanup().await;
            Err(AppError::new(crate::app_state::AppErrorKind::InvalidState, "download cancelled"))
        }
        result = tokio::time::timeout(config::timeouts::DOWNLOAD, download) => {
            match result {
                Ok(Ok(written)) => Ok((handle, written)),
                Ok(Err(e)) => {
                    handle.cleanup().await;
                    Err(e)
                }
                Err(_elapsed) => {
                    handle.cleanup().await;
                    Err(AppError::timeout("download exceeded 600s"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn downloads_body_and_reports_byte_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let url = reqwest::Url::parse(&format!("{}/video.mp4", server.uri())).unwrap();
        let http = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let (handle, written) = download_to_temp(&http, &url, "mp4", &cancel).await.unwrap();
        assert_eq!(written, 11);
        let bytes = tokio::fs::read(handle.path()).await.unwrap();
        assert_eq!(bytes, b"hello world");
        handle.cleanup().await;
    }

    #[tokio::test]
    async fn cancellation_before_completion_cleans_up_the_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 10]))
            .mount(&server)
            .await;

        let url = reqwest::Url::parse(&format!("{}/video.mp4", server.uri())).unwrap();
        let http = reqwest::Client::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = download_to_temp(&http, &url, "mp4", &cancel).await.unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::InvalidState);
    }
}
