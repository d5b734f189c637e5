//! B2 native API calls.
//!
//! [`B2Api`] is the narrow interface the upload pipeline talks through:
//! authorization, upload credentials, part transfer and finalization.
//! [`HttpApi`] implements it over HTTPS with `reqwest`, and also carries the
//! bucket and file listing calls the command line uses.

use crate::{
    config::Config,
    progress::{ProgressListener, ProgressStream},
};
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Body, Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const AUTO_CONTENT_TYPE: &str = "b2/x-auto";

/// Characters left as-is in `X-Bz-File-Name`; everything else is percent-encoded.
const FILE_NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Error, Debug)]
pub enum Error {
    #[error("Reqwest error: {0:?}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("Serde JSON error. Response: {1}")]
    SerdeJSONError(#[source] serde_json::Error, String),
    #[error("{operation} returned {status}. Response: {body}")]
    Status {
        operation: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("Uploaded content SHA1 {remote} does not match local SHA1 {local}")]
    HashMismatch { local: String, remote: String },
    #[error("Bucket name {0:?} must be at least 6 characters")]
    BucketNameTooShort(String),
}

/// A short-lived API session returned by `b2_authorize_account`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub account_id: String,
    pub api_url: String,
    pub authorization_token: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub recommended_part_size: u64,
    #[serde(default)]
    pub absolute_minimum_part_size: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrl {
    pub bucket_id: String,
    pub upload_url: String,
    pub authorization_token: String,
}

/// One-time credentials for uploading a single part of a large file.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartUrl {
    pub file_id: String,
    pub upload_url: String,
    pub authorization_token: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_file_sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_last_modified_millis: Option<String>,
    #[serde(rename = "content-blake2b", skip_serializing_if = "Option::is_none")]
    pub content_blake2b: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartLargeFile {
    pub bucket_id: String,
    pub file_name: String,
    pub content_type: String,
    pub file_info: FileInfo,
}

/// File metadata echoed by start, finish and list calls.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct B2File {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub bucket_id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub content_length: u64,
    #[serde(default)]
    pub content_sha1: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub file_id: String,
    #[serde(default)]
    pub file_info: FileInfo,
    pub file_name: String,
    #[serde(default)]
    pub upload_timestamp: i64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileNames {
    pub files: Vec<B2File>,
    pub next_file_name: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub account_id: String,
    pub bucket_id: String,
    pub bucket_name: String,
    pub bucket_type: String,
    #[serde(default)]
    pub revision: u64,
}

#[derive(Deserialize, Debug)]
struct Buckets {
    buckets: Vec<Bucket>,
}

/// The body and headers of a single-request upload.
pub struct FileUpload {
    pub file_name: String,
    pub sha1: String,
    pub blake2b: String,
    pub last_modified_millis: i64,
    pub data: Arc<Vec<u8>>,
    pub progress_listener: Option<ProgressListener>,
}

/// The body and headers of one part of a large file.
pub struct PartUpload {
    pub name: Arc<String>,
    /// 1-indexed, as sent in `X-Bz-Part-Number`.
    pub part_number: usize,
    pub sha1: String,
    pub data: Arc<Vec<u8>>,
    pub progress_listener: Option<ProgressListener>,
}

#[async_trait]
pub trait B2Api: Send + Sync {
    async fn authorize(&self) -> Result<Authorization, Error>;

    async fn get_upload_url(&self, auth: &Authorization, bucket_id: &str)
        -> Result<UploadUrl, Error>;

    async fn upload_file(&self, target: &UploadUrl, file: FileUpload) -> Result<B2File, Error>;

    async fn start_large_file(
        &self,
        auth: &Authorization,
        request: &StartLargeFile,
    ) -> Result<B2File, Error>;

    async fn get_upload_part_url(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<UploadPartUrl, Error>;

    /// Sends one part. Any status other than 200 is an [`Error::Status`].
    async fn upload_part(&self, target: &UploadPartUrl, part: PartUpload) -> Result<(), Error>;

    /// Assembles the uploaded parts, in the order of `part_sha1s`, into one file.
    async fn finish_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
        part_sha1s: &[String],
    ) -> Result<B2File, Error>;
}

pub struct HttpApi {
    client: Client,
    account_id: String,
    application_key: String,
    api_url: String,
}

impl HttpApi {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(HttpApi {
            client,
            account_id: config.account_id.clone(),
            application_key: config.application_key.clone(),
            api_url: config.api_url.trim_end_matches('/').to_owned(),
        })
    }

    fn call(&self, auth: &Authorization, name: &str) -> RequestBuilder {
        self.client
            .post(format!("{}/b2api/v2/{}", auth.api_url, name))
            .header(header::AUTHORIZATION, auth.authorization_token.as_str())
    }

    pub async fn list_buckets(&self, auth: &Authorization) -> Result<Vec<Bucket>, Error> {
        let req = self
            .call(auth, "b2_list_buckets")
            .json(&serde_json::json!({ "accountId": auth.account_id }));
        let buckets: Buckets = send_json("b2_list_buckets", req).await?;
        Ok(buckets.buckets)
    }

    pub async fn create_bucket(
        &self,
        auth: &Authorization,
        bucket_name: &str,
        public: bool,
    ) -> Result<Bucket, Error> {
        if bucket_name.chars().count() < 6 {
            return Err(Error::BucketNameTooShort(bucket_name.to_owned()));
        }
        let bucket_type = if public { "allPublic" } else { "allPrivate" };
        let req = self.call(auth, "b2_create_bucket").json(&serde_json::json!({
            "accountId": auth.account_id,
            "bucketName": bucket_name,
            "bucketType": bucket_type,
        }));
        let bucket: Bucket = send_json("b2_create_bucket", req).await?;
        tracing::info!(bucket_name, bucket_id = %bucket.bucket_id, "New bucket created");
        Ok(bucket)
    }

    pub async fn list_file_names(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        start_file_name: Option<&str>,
    ) -> Result<FileNames, Error> {
        let mut body = serde_json::json!({ "bucketId": bucket_id });
        if let Some(start) = start_file_name {
            body["startFileName"] = start.into();
        }
        let req = self.call(auth, "b2_list_file_names").json(&body);
        send_json("b2_list_file_names", req).await
    }
}

#[async_trait]
impl B2Api for HttpApi {
    async fn authorize(&self) -> Result<Authorization, Error> {
        let req = self
            .client
            .get(format!("{}/b2api/v2/b2_authorize_account", self.api_url))
            .basic_auth(&self.account_id, Some(&self.application_key));
        let auth: Authorization = send_json("b2_authorize_account", req).await?;

        if auth.account_id != self.account_id {
            tracing::warn!(
                api_account_id = %auth.account_id,
                config_account_id = %self.account_id,
                "Authorized account ID does not match the configured account ID"
            );
        }
        tracing::debug!(api_url = %auth.api_url, "Received API authorization");
        Ok(auth)
    }

    async fn get_upload_url(
        &self,
        auth: &Authorization,
        bucket_id: &str,
    ) -> Result<UploadUrl, Error> {
        let req = self
            .call(auth, "b2_get_upload_url")
            .json(&serde_json::json!({ "bucketId": bucket_id }));
        send_json("b2_get_upload_url", req).await
    }

    async fn upload_file(&self, target: &UploadUrl, file: FileUpload) -> Result<B2File, Error> {
        let len = file.data.len();
        let body = Body::wrap_stream(ProgressStream::new(
            Arc::new(file.file_name.clone()),
            1,
            file.data,
            file.progress_listener,
        ));
        let req = self
            .client
            .post(target.upload_url.as_str())
            .header(header::AUTHORIZATION, target.authorization_token.as_str())
            .header(header::CONTENT_TYPE, AUTO_CONTENT_TYPE)
            .header(header::CONTENT_LENGTH, len)
            .header("X-Bz-Content-Sha1", file.sha1.as_str())
            .header("X-Bz-File-Name", encode_file_name(&file.file_name))
            .header(
                "X-Bz-Info-src_last_modified_millis",
                file.last_modified_millis.to_string(),
            )
            .header("X-Bz-Info-Content-Blake2b", file.blake2b.as_str())
            .body(body);

        let uploaded: B2File = send_json("b2_upload_file", req).await?;
        if let Some(remote) = uploaded.content_sha1.as_deref() {
            if remote != file.sha1 {
                return Err(Error::HashMismatch {
                    local: file.sha1,
                    remote: remote.to_owned(),
                });
            }
        }
        Ok(uploaded)
    }

    async fn start_large_file(
        &self,
        auth: &Authorization,
        request: &StartLargeFile,
    ) -> Result<B2File, Error> {
        let req = self.call(auth, "b2_start_large_file").json(request);
        send_json("b2_start_large_file", req).await
    }

    async fn get_upload_part_url(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<UploadPartUrl, Error> {
        let req = self
            .call(auth, "b2_get_upload_part_url")
            .json(&serde_json::json!({ "fileId": file_id }));
        send_json("b2_get_upload_part_url", req).await
    }

    async fn upload_part(&self, target: &UploadPartUrl, part: PartUpload) -> Result<(), Error> {
        let len = part.data.len();
        let body = Body::wrap_stream(ProgressStream::new(
            part.name,
            part.part_number,
            part.data,
            part.progress_listener,
        ));
        let req = self
            .client
            .post(target.upload_url.as_str())
            .header(header::AUTHORIZATION, target.authorization_token.as_str())
            .header(header::CONTENT_LENGTH, len)
            .header("X-Bz-Part-Number", part.part_number.to_string())
            .header("X-Bz-Content-Sha1", part.sha1.as_str())
            .body(body);

        send_text("b2_upload_part", req).await?;
        Ok(())
    }

    async fn finish_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
        part_sha1s: &[String],
    ) -> Result<B2File, Error> {
        let req = self.call(auth, "b2_finish_large_file").json(&serde_json::json!({
            "fileId": file_id,
            "partSha1Array": part_sha1s,
        }));
        send_json("b2_finish_large_file", req).await
    }
}

pub fn encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, FILE_NAME_ENCODE_SET).to_string()
}

async fn send_text(operation: &'static str, req: RequestBuilder) -> Result<String, Error> {
    let resp = req.send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if status != StatusCode::OK {
        return Err(Error::Status {
            operation,
            status,
            body,
        });
    }
    Ok(body)
}

async fn send_json<T: DeserializeOwned>(
    operation: &'static str,
    req: RequestBuilder,
) -> Result<T, Error> {
    let body = send_text(operation, req).await?;
    serde_json::from_str(&body).map_err(|e| Error::SerdeJSONError(e, body))
}
