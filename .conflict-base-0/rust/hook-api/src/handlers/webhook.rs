use std::collections::HashMap;
use std::time::Instant;

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use hook_common::webhook::{WebhookJobMetadata, WebhookJobParameters};
use serde_derive::Deserialize;
use serde_json::Value;
use url::Url;

use hook_common::pgqueue::{NewJob, PgQueue};
use hook_common::webhook::HttpMethod;
use serde::Serialize;
use tracing::{debug, error};

#[derive(Serialize, Deserialize)]
pub struct WebhookPostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// The body of a request made to create a webhook Job.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct WebhookPostRequestBody {
    parameters: WebhookJobParameters,
    metadata: WebhookJobMetadata,

    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

pub async fn post_webhook(
    State(pg_queue): State<PgQueue>,
    body: Bytes,
) -> Result<Json<WebhookPostResponse>, (StatusCode, Json<WebhookPostResponse>)> {
    let payload: WebhookPostRequestBody = {
        // We don't use a `Json(payload): Json<WebhookPostRequestBody>` parameter above because we
        // want to strip out null characters while it's still a single string.

        let body_str = String::from_utf8(body.to_vec())
            .map_err(|e| bad_request(format!("invalid utf8: {e}")))?;

        let sanitized_str = replace_null_characters_in_stringified_json(&body_str);

        serde_json::from_str(&sanitized_str)
            .map_err(|e| bad_request(format!("invalid json: {e}")))?
    };

    debug!("received payload: {:?}", payload);

    let url_hostname = get_hostname(&payload.parameters.url)?;
    // We could cast to i32, but this ensures we are not wrapping.
    let max_attempts = i32::try_from(payload.max_attempts).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(WebhookPostResponse {
                error: Some("invalid number of max attempts".to_owned()),
            }),
        )
    })?;
    let job = NewJob::new(
        max_attempts,
        payload.metadata,
        payload.parameters,
        url_hostname.as_str(),
    );

    let start_time = Instant::now();

    pg_queue.enqueue(job).await.map_err(internal_error)?;

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("webhook_api_enqueue").record(elapsed_time);

    Ok(Json(WebhookPostResponse { error: None }))
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HoghookFetchParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HoghookArgs(
    String,
    #[serde(default, skip_serializing_if = "Option::is_none")] Option<HoghookFetchParameters>,
);

#[derive(Debug, Serialize, Deserialize)]
struct HoghookAsyncFunctionRequest {
    name: String,
    args: HoghookArgs,
}

pub async fn post_hoghook(
    State(pg_queue): State<PgQueue>,
    body: Bytes,
) -> Result<Json<WebhookPostResponse>, (StatusCode, Json<WebhookPostResponse>)> {
    let payload: Value = {
        // We don't use a `Json(payload): Json<Value>` parameter above because we want to strip
        // out null characters while it's still a single string.

        let body_str = String::from_utf8(body.to_vec())
            .map_err(|e| bad_request(format!("invalid utf8: {e}")))?;

        let sanitized_str = replace_null_characters_in_stringified_json(&body_str);

        serde_json::from_str(&sanitized_str)
            .map_err(|e| bad_request(format!("invalid json: {e}")))?
    };

    debug!("received payload: {:?}", payload);

    // We use these fields for metrics in the janitor, but we don't actually need to do anything
    // with them now.
    payload
        .get("teamId")
        .ok_or_else(|| bad_request("missing required field 'teamId'".to_owned()))?
        .as_number()
        .ok_or_else(|| bad_request("'teamId' is not a number".to_owned()))?;
    payload
        .get("hogFunctionId")
        .ok_or_else(|| bad_request("missing required field 'hogFunctionId'".to_owned()))?
        .as_str()
        .ok_or_else(|| bad_request("'hogFunctionId' is not a string".to_owned()))?;

    // We deserialize a copy of the `asyncFunctionRequest` field here because we want to leave
    // the original payload unmodified so that it can be passed through exactly as it came to us.
    let async_function_request = payload
        .get("asyncFunctionRequest")
        .ok_or_else(|| bad_request("missing required field 'asyncFunctionRequest'".to_owned()))?
        .clone();
    let async_function_request: HoghookAsyncFunctionRequest =
        serde_json::from_value(async_function_request).map_err(|err| {
            bad_request(format!(
                "unable to deserialize 'asyncFunctionRequest': {err}"
            ))
        })?;

    if async_function_request.name != "fetch" {
        return Err(bad_request(
            "asyncFunctionRequest.name must be 'fetch'".to_owned(),
        ));
    }

    // Note that the URL is parsed (and thus validated as a valid URL) as part of
    // `get_hostname` below.
    let url = async_function_request.args.0.clone();
    let parameters = if let Some(fetch_options) = async_function_request.args.1 {
        WebhookJobParameters {
            body: fetch_options.body.unwrap_or("".to_owned()),
            headers: fetch_options.headers.unwrap_or_default(),
            method: fetch_options.method.unwrap_or(HttpMethod::POST),
            url,
        }
    } else {
        WebhookJobParameters {
            body: "".to_owned(),
            headers: HashMap::new(),
            method: HttpMethod::POST,
            url,
        }
    };

    let url_hostname = get_hostname(&parameters.url)?;
    let max_attempts = default_max_attempts() as i32;

    let job = NewJob::new(max_attempts, payload, parameters, url_hostname.as_str());

    let start_time = Instant::now();

    pg_queue.enqueue(job).await.map_err(internal_error)?;

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("webhook_api_enqueue").record(elapsed_time);

    Ok(Json(WebhookPostResponse { error: None }))
}

fn bad_request(msg: String) -> (StatusCode, Json<WebhookPostResponse>) {
    error!(msg);
    (
        StatusCode::BAD_REQUEST,
        Json(WebhookPostResponse { error: Some(msg) }),
    )
}

fn internal_error<E>(err: E) -> (StatusCode, Json<WebhookPostResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(WebhookPostResponse {
            error: Some(err.to_string()),
        }),
    )
}

fn get_hostname(url_str: &str) -> Result<String, (StatusCode, Json<WebhookPostResponse>)> {
    let url = Url::parse(url_str).map_err(|e| bad_request(format!("could not parse url: {e}")))?;

    match url.host_str() {
        Some(hostname) => Ok(hostname.to_owned()),
        None => Err(bad_request("couldn't extract hostname from url".to_owned())),
    }
}

// TypeScript equivalent: https://github.com/PostHog/posthog/blob/ab059c4f05cbf9736390fc9386234dcade7aea40/plugin-server/src/utils/db/utils.ts#L185
fn replace_null_characters_in_stringified_json(s: &str) -> String {
    s.replace("\\u0000", "\\uFFFD")
}
