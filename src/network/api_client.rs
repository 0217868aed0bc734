use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use crate::constants::{HEADER_USER_ID, HEADER_USER_TYPE};
use crate::models::{
    Attachment, ChatMessage, Employee, Identity, NewTicket, Ticket, TicketFilter, TicketId, TicketStatus,
    TicketUpdate,
};

use super::config::ApiConfig;
use super::retry::{AttemptOutcome, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("API request failed: {status} {body}")]
    Http { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn outcome(&self) -> AttemptOutcome {
        match self {
            ApiError::Network(_) => AttemptOutcome::NetworkError,
            ApiError::Http { status, .. } => AttemptOutcome::HttpStatus(*status),
            ApiError::Decode(_) | ApiError::Encode(_) => AttemptOutcome::Fatal,
        }
    }
}

impl From<ApiError> for JsValue {
    fn from(error: ApiError) -> Self {
        JsValue::from_str(&error.to_string())
    }
}

fn js_error(value: JsValue) -> ApiError {
    ApiError::Network(value.as_string().unwrap_or_else(|| format!("{:?}", value)))
}

/// How requests identify the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// `X-User-Id` / `X-User-Type` headers.
    User(Identity),
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials::User(Identity::default())
    }
}

impl Credentials {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Credentials::Bearer(token) => vec![("Authorization", format!("Bearer {}", token))],
            Credentials::User(identity) => vec![
                (HEADER_USER_ID, identity.user_id.clone()),
                (HEADER_USER_TYPE, identity.user_type.as_str().to_string()),
            ],
        }
    }
}

/// A fully described JSON request, built before anything touches the network.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<String>,
}

#[derive(Serialize)]
struct NewMessageBody<'a> {
    content: &'a str,
    attachments: &'a [String],
}

/// List endpoints answer either with a bare array or with the array wrapped
/// in an object under a resource-specific key.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Wrapped(serde_json::Map<String, Value>),
}

fn decode_list<T: DeserializeOwned>(text: &str, key: &str) -> Result<Vec<T>, ApiError> {
    let listing: Listing<T> = serde_json::from_str(text).map_err(|e| ApiError::Decode(e.to_string()))?;
    match listing {
        Listing::Bare(items) => Ok(items),
        Listing::Wrapped(mut object) => {
            let items = [key, "items", "data"]
                .iter()
                .find_map(|k| object.remove(*k))
                .ok_or_else(|| ApiError::Decode(format!("expected an array or an object with '{}'", key)))?;
            serde_json::from_value(items).map_err(|e| ApiError::Decode(e.to_string()))
        }
    }
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ApiError> {
    serde_json::from_str(text).map_err(|e| ApiError::Decode(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string(value).map_err(|e| ApiError::Encode(e.to_string()))
}

/// REST client for the ticket API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiClient {
    config: ApiConfig,
    credentials: Credentials,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(config: ApiConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            retry: RetryPolicy::default(),
        }
    }

    /// Client against the globally configured API base.
    pub fn from_global(credentials: Credentials) -> Self {
        Self::new(super::api_config(), credentials)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn request(&self, method: &'static str, path: &str, body: Option<String>) -> ApiRequest {
        let mut headers = self.credentials.headers();
        if body.is_some() {
            headers.push(("Content-Type", "application/json".to_string()));
        }
        ApiRequest {
            method,
            url: self.config.url(path),
            headers,
            body,
        }
    }

    // ---------------- Tickets ----------------

    pub fn create_ticket_request(&self, ticket: &NewTicket) -> Result<ApiRequest, ApiError> {
        Ok(self.request("POST", "/tickets", Some(encode(ticket)?)))
    }

    pub async fn create_ticket(&self, ticket: &NewTicket) -> Result<Ticket, ApiError> {
        let text = self.execute(&self.create_ticket_request(ticket)?).await?;
        decode(&text)
    }

    pub async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, ApiError> {
        let request = self.request("GET", &format!("/tickets{}", filter.to_query()), None);
        let text = self.execute(&request).await?;
        decode_list(&text, "tickets")
    }

    pub async fn get_ticket(&self, ticket_id: TicketId) -> Result<Ticket, ApiError> {
        let request = self.request("GET", &format!("/tickets/{}", ticket_id), None);
        decode(&self.execute(&request).await?)
    }

    pub async fn update_ticket(&self, ticket_id: TicketId, update: &TicketUpdate) -> Result<Ticket, ApiError> {
        let request = self.request("PATCH", &format!("/tickets/{}", ticket_id), Some(encode(update)?));
        decode(&self.execute(&request).await?)
    }

    pub fn update_ticket_status_request(&self, ticket_id: TicketId, status: TicketStatus) -> ApiRequest {
        let body = json!({ "status": status }).to_string();
        self.request("PATCH", &format!("/tickets/{}/status", ticket_id), Some(body))
    }

    pub async fn update_ticket_status(&self, ticket_id: TicketId, status: TicketStatus) -> Result<Ticket, ApiError> {
        let text = self.execute(&self.update_ticket_status_request(ticket_id, status)).await?;
        decode(&text)
    }

    pub async fn delete_ticket(&self, ticket_id: TicketId) -> Result<(), ApiError> {
        let request = self.request("DELETE", &format!("/tickets/{}", ticket_id), None);
        let _ = self.execute(&request).await?;
        Ok(())
    }

    // ---------------- Messages ----------------

    pub async fn list_messages(&self, ticket_id: TicketId) -> Result<Vec<ChatMessage>, ApiError> {
        let request = self.request("GET", &format!("/tickets/{}/messages", ticket_id), None);
        decode_list(&self.execute(&request).await?, "messages")
    }

    pub fn add_message_request(
        &self,
        ticket_id: TicketId,
        content: &str,
        attachments: &[String],
    ) -> Result<ApiRequest, ApiError> {
        let body = encode(&NewMessageBody { content, attachments })?;
        Ok(self.request("POST", &format!("/tickets/{}/messages", ticket_id), Some(body)))
    }

    /// REST fallback for sending a message when the realtime channel is down.
    pub async fn add_message(
        &self,
        ticket_id: TicketId,
        content: &str,
        attachments: &[String],
    ) -> Result<ChatMessage, ApiError> {
        let request = self.add_message_request(ticket_id, content, attachments)?;
        decode(&self.execute(&request).await?)
    }

    pub fn mark_messages_read_request(&self, ticket_id: TicketId, message_ids: &[String]) -> ApiRequest {
        let body = json!({ "message_ids": message_ids }).to_string();
        self.request("POST", &format!("/tickets/{}/messages/read", ticket_id), Some(body))
    }

    pub async fn mark_messages_read(&self, ticket_id: TicketId, message_ids: &[String]) -> Result<(), ApiError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let _ = self.execute(&self.mark_messages_read_request(ticket_id, message_ids)).await?;
        Ok(())
    }

    /// Multipart upload of one file; the returned attachment id goes into
    /// the `attachments` list of a later chat message.
    pub async fn upload_attachment(&self, ticket_id: TicketId, file: &web_sys::File) -> Result<Attachment, ApiError> {
        let url = self.config.url(&format!("/tickets/{}/attachments", ticket_id));
        let mut attempt = 0;
        loop {
            attempt += 1;
            let form = web_sys::FormData::new().map_err(js_error)?;
            form.append_with_blob_and_filename("file", file, &file.name())
                .map_err(js_error)?;
            let body: &JsValue = form.as_ref();
            let result = self.send_once("POST", &url, None, Some(body)).await;
            match self.retry_delay(attempt, &result) {
                Some(delay) => gloo_timers::future::TimeoutFuture::new(delay).await,
                None => return decode(&result?),
            }
        }
    }

    // ---------------- Employees ----------------

    pub async fn list_employees(&self) -> Result<Vec<Employee>, ApiError> {
        let request = self.request("GET", "/employees", None);
        decode_list(&self.execute(&request).await?, "employees")
    }

    pub async fn get_employee(&self, employee_id: &str) -> Result<Employee, ApiError> {
        let request = self.request("GET", &format!("/employees/{}", employee_id), None);
        decode(&self.execute(&request).await?)
    }

    // ---------------- Transport ----------------

    fn retry_delay(&self, attempt: u32, result: &Result<String, ApiError>) -> Option<u32> {
        let error = result.as_ref().err()?;
        let delay = self.retry.next_delay_ms(attempt, error.outcome())?;
        warn_log!("Request failed ({}); retry {} in {} ms", error, attempt, delay);
        Some(delay)
    }

    /// Runs `request`, retrying transient failures per the retry policy.
    pub async fn execute(&self, request: &ApiRequest) -> Result<String, ApiError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let body = request.body.as_deref().map(JsValue::from_str);
            let result = self
                .send_once(request.method, &request.url, Some(request.headers.as_slice()), body.as_ref())
                .await;
            match self.retry_delay(attempt, &result) {
                Some(delay) => gloo_timers::future::TimeoutFuture::new(delay).await,
                None => return result,
            }
        }
    }

    /// One fetch. `headers` of `None` means "credentials only" (used by the
    /// multipart upload, where the browser sets the content type).
    async fn send_once(
        &self,
        method: &str,
        url: &str,
        headers: Option<&[(&'static str, String)]>,
        body: Option<&JsValue>,
    ) -> Result<String, ApiError> {
        use web_sys::{Headers, Request, RequestInit, RequestMode, Response};

        debug_log!("{} {}", method, url);

        let opts = RequestInit::new();
        opts.set_method(method);
        opts.set_mode(RequestMode::Cors);

        let js_headers = Headers::new().map_err(js_error)?;
        let credential_headers;
        let headers = match headers {
            Some(headers) => headers,
            None => {
                credential_headers = self.credentials.headers();
                credential_headers.as_slice()
            }
        };
        for (name, value) in headers {
            js_headers.append(name, value).map_err(js_error)?;
        }
        opts.set_headers(&js_headers);
        if let Some(body) = body {
            opts.set_body(body);
        }

        let request = Request::new_with_str_and_init(url, &opts).map_err(js_error)?;
        let window = web_sys::window().ok_or_else(|| ApiError::Network("no global window".into()))?;
        let response_value = JsFuture::from(window.fetch_with_request(&request))
            .await
            .map_err(js_error)?;
        let response: Response = response_value.dyn_into().map_err(js_error)?;

        let text_promise = response.text().map_err(js_error)?;
        let text = JsFuture::from(text_promise)
            .await
            .map_err(js_error)?
            .as_string()
            .unwrap_or_default();

        if !response.ok() {
            return Err(ApiError::Http {
                status: response.status(),
                body: text,
            });
        }
        Ok(text)
    }
}
