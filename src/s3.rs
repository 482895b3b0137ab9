use std::path::Path;

use reqwest::Url;

use crate::{app_state::AppError, loopback};

/// PUTs a presigned URL with `Content-Type` and `Content-Length` set, requiring a
/// 2xx response. Used for in-memory buffers (thumbnails, extracted audio).
pub async fn upload_to_s3(
    client: &reqwest::Client,
    url: &Url,
    body: Vec<u8>,
    content_type: &str,
) -> Result<(), AppError> {
    let (bridged, host) = loopback::bridge(url);
    let content_length = body.len() as u64;
    let mut request = client
        .put(bridged)
        .header(reqwest::header::CONTENT_TYPE, content_type)
        .header(reqwest::header::CONTENT_LENGTH, content_length)
        .body(body);
    if let Some(host) = host {
        request = request.header(reqwest::header::HOST, host);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(AppError::new(
            crate::app_state::AppErrorKind::UploadFailed,
            format!("S3 PUT returned {}", response.status()),
        ));
    }
    Ok(())
}

/// `uploadFileToS3`: reads the file at `path` and performs the same PUT.
pub async fn upload_file_to_s3(
    client: &reqwest::Client,
    url: &Url,
    path: &Path,
    content_type: &str,
) -> Result<(), AppError> {
    let body = tokio::fs::read(path).await?;
    upload_to_s3(client, url, body, content_type).await
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn non_2xx_response_is_upload_failed() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/upload", server.uri())).unwrap();
        let client = reqwest::Client::new();
        let err = upload_to_s3(&client, &url, b"hello".to_vec(), "text/plain")
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::UploadFailed);
    }

    #[tokio::test]
    async fn successful_put_sets_content_headers() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload"))
            .and(header("content-type", "image/jpeg"))
            .and(header("content-length", "5"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/upload", server.uri())).unwrap();
        let client = reqwest::Client::new();
        upload_to_s3(&client, &url, b"hello".to_vec(), "image/jpeg").await.unwrap();
    }
}
