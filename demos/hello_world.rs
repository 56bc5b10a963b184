use maker_ws::{
    Body, BoxError, Dispatcher, HeaderSet, Method, RequestSignature, Response, Server, StatusCode,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

struct Hello;

impl Dispatcher for Hello {
    fn can_process(&self, method: Method, path: &str) -> bool {
        matches!(method, Method::Get | Method::Head) && path == "/"
    }

    async fn handle(
        &self,
        sig: &RequestSignature,
        _: &HeaderSet,
        _: &mut Body<'_>,
    ) -> Result<Response, BoxError> {
        let name = sig.query("name").unwrap_or("world");

        Ok(Response::new(StatusCode::Ok)
            .header("content-type", "text/plain; charset=utf-8")
            .body(format!("Hello, {name}!")))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .dispatcher(Hello)
        .build()
        .unwrap()
        .launch()
        .await;
}
