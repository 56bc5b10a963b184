use maker_ws::{
    limits::ReqLimits, Body, BoxError, Cookie, Dispatcher, HeaderSet, Method, RequestSignature,
    Response, SameSite, Server, StatusCode,
};
use std::{fmt::Write, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

struct FormEcho;

impl Dispatcher for FormEcho {
    fn can_process(&self, method: Method, path: &str) -> bool {
        method == Method::Post && path == "/form"
    }

    fn has_path(&self, path: &str) -> bool {
        path == "/form"
    }

    async fn handle(
        &self,
        _: &RequestSignature,
        headers: &HeaderSet,
        body: &mut Body<'_>,
    ) -> Result<Response, BoxError> {
        let visits = headers
            .get("cookie")
            .and_then(|c| c.split(';').find_map(|p| p.trim().strip_prefix("visits=")))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let mut fields: Vec<_> = body.form().await?.iter().collect();
        fields.sort();

        let mut text = String::new();
        for (key, value) in fields {
            writeln!(text, "{key} = {value}")?;
        }

        Ok(Response::new(StatusCode::Ok)
            .header("content-type", "text/plain; charset=utf-8")
            .cookie(
                Cookie::new("visits", (visits + 1).to_string())
                    .path("/form")
                    .max_age(Duration::from_secs(3600))
                    .http_only(true)
                    .same_site(SameSite::Lax),
            )
            .body(text))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .dispatcher(FormEcho)
        .request_limits(ReqLimits {
            form_fields: 64,
            ..ReqLimits::default()
        })
        .build()
        .unwrap()
        .launch()
        .await;
}
