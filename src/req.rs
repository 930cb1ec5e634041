use std::time::Duration;

use reqwest::{header::CONTENT_TYPE, Client, Response};

use crate::api::Problem;

pub(crate) type ReqResult<T> = std::result::Result<T, Problem>;

/// Builds the HTTP client shared by every ACME request of a session.
///
/// `insecure` disables certificate verification, for test CAs such as Pebble.
pub(crate) fn http_client(insecure: bool) -> eyre::Result<Client> {
    if insecure {
        log::warn!("TLS certificate verification is disabled for the ACME server");
    }

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(30))
        .danger_accept_invalid_certs(insecure)
        .build()?;

    Ok(client)
}

pub(crate) async fn req_get(client: &Client, url: &str) -> ReqResult<Response> {
    log::trace!("GET {url}");
    client.get(url).send().await.map_err(transport_problem)
}

pub(crate) async fn req_head(client: &Client, url: &str) -> ReqResult<Response> {
    log::trace!("HEAD {url}");
    client.head(url).send().await.map_err(transport_problem)
}

pub(crate) async fn req_post(client: &Client, url: &str, body: String) -> ReqResult<Response> {
    log::trace!("POST {url} {body}");
    client
        .post(url)
        .header(CONTENT_TYPE, "application/jose+json")
        .body(body)
        .send()
        .await
        .map_err(transport_problem)
}

fn transport_problem(err: reqwest::Error) -> Problem {
    Problem::new("httpReqError", Some(err.to_string()))
}

/// Passes 2xx responses through and turns everything else into a [`Problem`].
pub(crate) async fn req_handle_error(res: ReqResult<Response>) -> ReqResult<Response> {
    let res = res?;

    if res.status().is_success() {
        return Ok(res);
    }

    let is_problem_json = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    let status = res.status();
    let body = req_safe_read_body(res).await;

    let problem = if is_problem_json {
        serde_json::from_str(&body).unwrap_or_else(|err| {
            Problem::new(
                "problemJsonFail",
                Some(format!(
                    "failed to deserialize application/problem+json ({err}) body: {body}"
                )),
            )
        })
    } else {
        Problem::new("httpReqError", Some(format!("{status} body: {body}")))
    };

    Err(problem)
}

pub(crate) fn req_expect_header(res: &Response, name: &str) -> ReqResult<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Problem::new(format!("missing header: {name}"), None))
}

/// Reads the body as text; servers occasionally cut the TLS stream after a complete body.
pub(crate) async fn req_safe_read_body(res: Response) -> String {
    res.text().await.unwrap_or_default()
}
