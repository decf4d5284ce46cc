use aws_config::BehaviorVersion;
use aws_lambda_events::apigw::{ApiGatewayV2httpRequest, ApiGatewayV2httpResponse};
use aws_lambda_events::encodings::Body;
use aws_lambda_events::http::header::CONTENT_TYPE;
use aws_lambda_events::http::{HeaderMap, HeaderValue, Method};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use dispatch_sqs::SqsDispatcher;
use engine::{Submission, SubmissionService, SubmitError};
use lambda_runtime::{service_fn, tracing, Error, LambdaEvent};
use model::env;
use model::spec::NetworkRequestSpec;
use serde_json::json;
use state::{RequestPage, StateErrorReason};
use state_dynamodb::DynamoDbRecordStore;
use std::sync::Arc;

const IDEMPOTENCY_HEADER: &'static str = "idempotency-key";

/// HTTP front for the submission service.
///
/// POST /vpcs submits (or replays) a provisioning request, GET /vpcs
/// lists the caller's requests, GET /vpcs/{id} reads one. Callers are
/// identified by the `sub` claim of the JWT authorizer.
async fn http_handler(
    service: &SubmissionService,
    event: LambdaEvent<ApiGatewayV2httpRequest>,
) -> Result<ApiGatewayV2httpResponse, Error> {
    let request: ApiGatewayV2httpRequest = event.payload;

    let caller: String = match caller_sub(&request) {
        Some(sub) => sub,
        None => return Ok(resp(401, json!({ "message": "Missing JWT subject (sub)" }))),
    };

    let method: &Method = &request.request_context.http.method;
    let path: &str = request
        .request_context
        .http
        .path
        .as_deref()
        .unwrap_or("/");

    match (method, path) {
        (&Method::POST, "/vpcs") => post_vpcs(service, &caller, &request).await,
        (&Method::GET, "/vpcs") => get_vpcs(service, &caller, &request).await,
        (&Method::GET, _) if path.starts_with("/vpcs/") => {
            let request_id: &str = &path["/vpcs/".len()..];

            if request_id.is_empty() {
                return Ok(not_found());
            }

            get_vpc_by_id(service, request_id).await
        }
        _ => Ok(not_found()),
    }
}

async fn post_vpcs(
    service: &SubmissionService,
    caller: &str,
    request: &ApiGatewayV2httpRequest,
) -> Result<ApiGatewayV2httpResponse, Error> {
    let idempotency_key: &str = match request
        .headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        Some(key) if !key.is_empty() => key,
        _ => return Ok(resp(400, json!({ "message": "Missing Idempotency-Key header" }))),
    };

    let spec: NetworkRequestSpec = match parse_body(request) {
        Ok(spec) => spec,
        Err(message) => return Ok(resp(400, json!({ "message": message }))),
    };

    match service.submit(caller, idempotency_key, spec).await {
        // 202 for both new submissions and idempotent replays
        Ok(submission) => Ok(resp(202, submission_body(submission))),
        Err(SubmitError::Validation(err)) => Ok(resp(400, json!({ "message": err.to_string() }))),
        Err(err) => Err(err.into()),
    }
}

async fn get_vpcs(
    service: &SubmissionService,
    caller: &str,
    request: &ApiGatewayV2httpRequest,
) -> Result<ApiGatewayV2httpResponse, Error> {
    let limit: Option<usize> = request
        .query_string_parameters
        .first("limit")
        .and_then(|raw| raw.parse().ok());
    let next_token: Option<&str> = request.query_string_parameters.first("next_token");

    let page: RequestPage = match service.list(caller, limit, next_token).await {
        Ok(page) => page,
        Err(err) if matches!(err.reason, StateErrorReason::BadRecord(_)) => {
            return Ok(resp(400, json!({ "message": "Invalid next_token" })))
        }
        Err(err) => return Err(err.into()),
    };

    let mut body = json!({ "items": page.items });
    if let Some(token) = page.next_token {
        body["next_token"] = json!(token);
    }

    Ok(resp(200, body))
}

async fn get_vpc_by_id(
    service: &SubmissionService,
    request_id: &str,
) -> Result<ApiGatewayV2httpResponse, Error> {
    match service.get(request_id).await? {
        Some(request) => Ok(resp(200, serde_json::to_value(request)?)),
        None => Ok(not_found()),
    }
}

fn caller_sub(request: &ApiGatewayV2httpRequest) -> Option<String> {
    request
        .request_context
        .authorizer
        .as_ref()
        .and_then(|authorizer| authorizer.jwt.as_ref())
        .and_then(|jwt| jwt.claims.get("sub"))
        .filter(|sub| !sub.is_empty())
        .cloned()
}

fn parse_body(request: &ApiGatewayV2httpRequest) -> Result<NetworkRequestSpec, String> {
    let raw: &str = request.body.as_deref().unwrap_or_default();

    let decoded: String = if request.is_base64_encoded {
        let bytes = BASE64_STANDARD
            .decode(raw)
            .map_err(|err| format!("Invalid base64 body: {err}"))?;

        String::from_utf8(bytes).map_err(|err| format!("Invalid body encoding: {err}"))?
    } else {
        raw.to_string()
    };

    serde_json::from_str(&decoded).map_err(|err| format!("Invalid request body: {err}"))
}

fn submission_body(submission: Submission) -> serde_json::Value {
    if submission.is_new {
        return json!({
            "request_id": submission.request_id,
            "status": submission.status,
        });
    }

    json!({
        "request_id": submission.request_id,
        "status": submission.status,
        "result": submission.result,
        "error_message": submission.error_message,
    })
}

fn resp(status_code: i64, body: serde_json::Value) -> ApiGatewayV2httpResponse {
    let mut headers: HeaderMap = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    ApiGatewayV2httpResponse {
        status_code,
        headers,
        body: Some(Body::Text(body.to_string())),
        ..Default::default()
    }
}

fn not_found() -> ApiGatewayV2httpResponse {
    resp(404, json!({ "message": "Not found" }))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::init_default_subscriber();

    let table_name: String = std::env::var(env::TABLE_NAME)?;
    let queue_url: String = std::env::var(env::QUEUE_URL)?;

    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;

    let service: SubmissionService = SubmissionService::new(
        Arc::new(DynamoDbRecordStore::new(
            aws_sdk_dynamodb::Client::new(&config),
            table_name,
        )),
        Arc::new(SqsDispatcher::new(
            aws_sdk_sqs::Client::new(&config),
            queue_url,
        )),
    );

    lambda_runtime::run(service_fn(|event: LambdaEvent<ApiGatewayV2httpRequest>| {
        http_handler(&service, event)
    }))
    .await
}
