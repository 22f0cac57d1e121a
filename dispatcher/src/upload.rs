//! Relays browser file uploads to the data management service.
//!
//! Every file in the form is forwarded on its own through the `data_api`
//! dispatcher into the user's home directory. The browser gets one JSON object
//! with a result per form field; a failed file never stops its siblings.

use crate::dispatch::{DispatchError, Dispatcher};
use crate::metrics_defs::UPLOAD_FILES;
use crate::session::RequestContext;
use crate::wrapper::{HttpMethod, MultipartPart, ServiceCallWrapper};
use bytes::Bytes;
use serde_json::{Map, Value, json};
use shared::counter;
use std::sync::Arc;

const USER_FIELD: &str = "user";
const EMAIL_FIELD: &str = "email";

#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error("invalid multipart form: {0}")]
    Form(#[from] multer::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("home directory service returned an empty path")]
    EmptyHomeDirectory,
    #[error("upload service response has no file id")]
    MissingFileId,
    #[error("upload service response is not JSON: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

/// One field of a submitted form.
#[derive(Debug, Clone)]
pub struct FormItem {
    pub field_name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FormItem {
    pub fn is_file(&self) -> bool {
        self.content_type.is_some() && self.filename.is_some() && !self.data.is_empty()
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Parses a complete `multipart/form-data` body into its fields, in order.
pub async fn parse_form(content_type: &str, body: Bytes) -> Result<Vec<FormItem>, UploadError> {
    let boundary = multer::parse_boundary(content_type)?;
    let stream = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut items = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(|mime| mime.to_string());
        let data = field.bytes().await?;
        items.push(FormItem {
            field_name,
            filename,
            content_type,
            data,
        });
    }
    Ok(items)
}

impl UploadError {
    /// A message that is safe to show the browser.
    pub fn detail(&self) -> String {
        match self {
            UploadError::Dispatch(e) => e.detail(),
            UploadError::InvalidResponse(_) => "upload service returned an invalid response".into(),
            other => other.to_string(),
        }
    }
}

fn error_entry(error: &UploadError, error_type: &str) -> Value {
    json!({ "error": error.detail(), "error_type": error_type })
}

pub struct UploadAction {
    dispatcher: Arc<Dispatcher>,
    home_dir_service: String,
    file_upload_service: String,
    mark_success: bool,
}

impl UploadAction {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        home_dir_service: impl Into<String>,
        file_upload_service: impl Into<String>,
    ) -> Self {
        UploadAction {
            dispatcher,
            home_dir_service: home_dir_service.into(),
            file_upload_service: file_upload_service.into(),
            mark_success: false,
        }
    }

    /// Adds `"success": "true"` to every result. Used by the make-public form.
    pub fn with_success_marker(mut self) -> Self {
        self.mark_success = true;
        self
    }

    /// Forwards every file item and returns the per-field results.
    pub async fn execute(&self, ctx: &RequestContext, items: Vec<FormItem>) -> Map<String, Value> {
        let mut results = Map::new();

        // Absent echo fields come back as null.
        for echo in [USER_FIELD, EMAIL_FIELD] {
            let value = items
                .iter()
                .find(|item| item.filename.is_none() && item.field_name == echo)
                .map(FormItem::text);
            results.insert(echo.into(), value.map_or(Value::Null, Value::String));
        }

        let home_dir = if items.iter().any(FormItem::is_file) {
            Some(self.home_dir(ctx).await)
        } else {
            None
        };

        for item in items {
            if !item.is_file() {
                let text = item.text();
                results.insert(item.field_name, Value::String(text));
                continue;
            }

            let field_name = item.field_name.clone();
            let entry = match &home_dir {
                Some(Ok(home)) => match self.upload_file(ctx, home, item).await {
                    Ok(file_id) => {
                        counter!(UPLOAD_FILES, "outcome" => "success").increment(1);
                        Value::String(file_id)
                    }
                    Err(e) => {
                        counter!(UPLOAD_FILES, "outcome" => "error").increment(1);
                        tracing::error!(field = %field_name, error = %e, "unable to upload file");
                        error_entry(&e, "UploadFailed")
                    }
                },
                Some(Err(e)) => {
                    counter!(UPLOAD_FILES, "outcome" => "error").increment(1);
                    error_entry(e, "HomeDirectoryUnavailable")
                }
                None => continue,
            };
            results.insert(field_name, entry);
        }

        if self.mark_success {
            results.insert("success".into(), Value::String("true".into()));
        }
        results
    }

    async fn home_dir(&self, ctx: &RequestContext) -> Result<String, UploadError> {
        let wrapper = ServiceCallWrapper::new(HttpMethod::Get, self.home_dir_service.as_str());
        let home = self
            .dispatcher
            .get_service_data(ctx, wrapper)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "unable to get the user's home directory"))?;

        let home = home.trim();
        if home.is_empty() {
            return Err(UploadError::EmptyHomeDirectory);
        }
        Ok(home.to_string())
    }

    async fn upload_file(
        &self,
        ctx: &RequestContext,
        home_dir: &str,
        item: FormItem,
    ) -> Result<String, UploadError> {
        let parts = vec![
            MultipartPart {
                name: "file".into(),
                filename: item.filename,
                content_type: item.content_type,
                data: item.data,
            },
            MultipartPart::text("dest", home_dir),
        ];
        let wrapper =
            ServiceCallWrapper::new(HttpMethod::Post, self.file_upload_service.as_str())
                .with_parts(parts);

        let response = self.dispatcher.get_service_data(ctx, wrapper).await?;
        let json: Value = serde_json::from_str(&response)?;
        json.get("file")
            .and_then(|file| file.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(UploadError::MissingFileId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherKind;
    use crate::connectors::DataApiConnector;
    use crate::dispatch::AppendUserPart;
    use crate::testutils::alice_context;
    use http::Method;
    use resolver::ServiceCallResolver;
    use std::collections::HashMap;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BOUNDARY: &str = "----workbench-boundary";

    fn action(backend: &str) -> UploadAction {
        let aliases = HashMap::from([
            ("prefix".to_string(), "org.iplantc.services".to_string()),
            (
                "org.iplantc.services.home".to_string(),
                format!("{backend}/home"),
            ),
            (
                "org.iplantc.services.upload".to_string(),
                format!("{backend}/upload"),
            ),
        ]);
        let dispatcher = Dispatcher::new(
            DispatcherKind::DataApi,
            Arc::new(ServiceCallResolver::new(aliases).unwrap()),
            Arc::new(DataApiConnector),
            Arc::new(AppendUserPart),
            reqwest::Client::new(),
        );
        UploadAction::new(
            Arc::new(dispatcher),
            "org.iplantc.services.home",
            "org.iplantc.services.upload",
        )
    }

    fn file(field: &str, filename: &str, data: &'static [u8]) -> FormItem {
        FormItem {
            field_name: field.into(),
            filename: Some(filename.into()),
            content_type: Some("text/plain".into()),
            data: Bytes::from_static(data),
        }
    }

    fn text(field: &str, value: &'static str) -> FormItem {
        FormItem {
            field_name: field.into(),
            filename: None,
            content_type: None,
            data: Bytes::from_static(value.as_bytes()),
        }
    }

    async fn mock_home(backend: &MockServer, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/home"))
            .and(query_param("user", "alice"))
            .respond_with(template)
            .mount(backend)
            .await;
    }

    fn ctx() -> RequestContext {
        alice_context(Method::POST, Some("multipart/form-data; boundary=x"))
    }

    #[tokio::test]
    async fn test_partial_batch_failure() {
        let backend = MockServer::start().await;
        mock_home(
            &backend,
            ResponseTemplate::new(200).set_body_string("/iplant/home/alice\n"),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(body_string_contains("filename=\"first.txt\""))
            .and(body_string_contains("/iplant/home/alice"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"file":{"id":"/iplant/home/alice/first.txt"}}"#),
            )
            .expect(1)
            .mount(&backend)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(body_string_contains("filename=\"second.txt\""))
            .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
            .expect(1)
            .mount(&backend)
            .await;

        let items = vec![
            text("user", "alice"),
            text("email", "alice@example.org"),
            file("file1", "first.txt", b"one"),
            file("file2", "second.txt", b"two"),
            text("comment", "nightly batch"),
        ];
        let results = action(&backend.uri()).execute(&ctx(), items).await;

        assert_eq!(results["user"], "alice");
        assert_eq!(results["email"], "alice@example.org");
        assert_eq!(results["file1"], "/iplant/home/alice/first.txt");
        assert_eq!(results["file2"]["error_type"], "UploadFailed");
        assert!(results["file2"]["error"].as_str().unwrap().contains("500"));
        assert_eq!(results["comment"], "nightly batch");
        assert!(results.get("success").is_none());
    }

    #[tokio::test]
    async fn test_home_dir_failure_marks_every_file() {
        let backend = MockServer::start().await;
        mock_home(&backend, ResponseTemplate::new(503)).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;

        let items = vec![
            file("file1", "first.txt", b"one"),
            file("file2", "second.txt", b"two"),
        ];
        let results = action(&backend.uri()).execute(&ctx(), items).await;

        assert_eq!(results["user"], Value::Null);
        assert_eq!(results["email"], Value::Null);
        for field in ["file1", "file2"] {
            assert_eq!(results[field]["error_type"], "HomeDirectoryUnavailable");
        }
    }

    #[tokio::test]
    async fn test_errors_hide_backend_addresses() {
        let items = vec![text("email", "alice@example.org"), file("file1", "first.txt", b"one")];
        let results = action("http://127.0.0.1:1/secret-home")
            .execute(&ctx(), items)
            .await;

        assert_eq!(results["user"], Value::Null);
        assert_eq!(results["email"], "alice@example.org");
        assert_eq!(results["file1"]["error_type"], "HomeDirectoryUnavailable");
        let message = results["file1"]["error"].as_str().unwrap();
        assert_eq!(message, "unable to reach the service");
        assert!(!message.contains("127.0.0.1"));
        assert!(!message.contains("user=alice"));
    }

    #[tokio::test]
    async fn test_no_files_skips_home_dir() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;

        let items = vec![
            text("user", "alice"),
            // An empty file is echoed like a text field.
            file("file1", "empty.txt", b""),
        ];
        let results = action(&backend.uri())
            .with_success_marker()
            .execute(&ctx(), items)
            .await;

        assert_eq!(results["file1"], "");
        assert_eq!(results["success"], "true");
    }

    #[tokio::test]
    async fn test_parse_form() {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"user\"\r\n\r\n\
             alice\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file1\"; filename=\"reads.fastq\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             GATTACA\r\n\
             --{BOUNDARY}--\r\n"
        );
        let items = parse_form(
            &format!("multipart/form-data; boundary={BOUNDARY}"),
            Bytes::from(body),
        )
        .await
        .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].field_name, "user");
        assert!(!items[0].is_file());
        assert_eq!(items[0].data, Bytes::from_static(b"alice"));
        assert_eq!(items[1].filename.as_deref(), Some("reads.fastq"));
        assert_eq!(
            items[1].content_type.as_deref(),
            Some("application/octet-stream")
        );
        assert!(items[1].is_file());
    }

    #[tokio::test]
    async fn test_parse_form_without_boundary() {
        assert!(matches!(
            parse_form("multipart/form-data", Bytes::new()).await,
            Err(UploadError::Form(_))
        ));
    }
}
