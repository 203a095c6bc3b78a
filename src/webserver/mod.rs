//! Optional HTTP API for a running pipeline.
//!
//! - `GET /pipeline`: the bound [`PipelineConfig`] as JSON.
//! - `GET /metrics`: everything in the Prometheus default registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::metrics::render_metrics;
use crate::pipeline::PipelineConfig;

struct State {
    pipeline_json: String,
}

fn app(config: &PipelineConfig) -> PipelineResult<Router> {
    let pipeline_json = serde_json::to_string(config)
        .map_err(|err| PipelineError::Config(format!("can't serialize pipeline: {err}")))?;
    let shared_state = Arc::new(State { pipeline_json });

    Ok(Router::new()
        .route("/pipeline", get(get_pipeline))
        .route("/metrics", get(get_metrics))
        .layer(Extension(shared_state)))
}

pub async fn run_webserver(config: PipelineConfig, port: u16) -> PipelineResult<()> {
    let app = app(&config)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting pipeline API server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| {
            PipelineError::Config(format!(
                "unable to run local webserver at port {port}: {err}"
            ))
        })
}

async fn get_pipeline(Extension(state): Extension<Arc<State>>) -> impl IntoResponse {
    // Body is already JSON.
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        state.pipeline_json.clone(),
    )
}

async fn get_metrics() -> Response {
    match render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use chrono::TimeZone;
    use chrono::Utc;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::clock::TestingClock;
    use crate::inputs::TestingInputConfig;
    use crate::metrics::initialize_metrics;
    use crate::outputs::TestingOutputConfig;
    use crate::pipeline::OutputTarget;
    use crate::pipeline::SourceEndpoint;
    use crate::recovery::InMemCheckpointStore;
    use crate::worker;

    fn config(source: SourceEndpoint) -> PipelineConfig {
        PipelineConfig::new(source, "/tmp/ckpt", OutputTarget::new("/tmp/out.txt"))
    }

    /// Serve `config` on a free port and return the raw response to
    /// `GET path`.
    fn get(config: &PipelineConfig, path: &str) -> String {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = app(config).unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

        rt.block_on(async move {
            tokio::spawn(
                axum::Server::from_tcp(listener)
                    .unwrap()
                    .serve(app.into_make_service()),
            );

            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut buf = String::new();
            stream.read_to_string(&mut buf).await.unwrap();
            buf
        })
    }

    #[test]
    fn serves_pipeline_json() {
        let config = config(SourceEndpoint::new("localhost", 9999));
        let body = get(&config, "/pipeline");

        assert!(body.starts_with("HTTP/1.1 200"), "{body}");
        assert!(body.contains("application/json"), "{body}");
        let json = body.split("\r\n\r\n").nth(1).unwrap();
        let found: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(found, config);
    }

    #[test]
    fn serves_metrics_without_stop_words() {
        initialize_metrics().unwrap();
        // Other tests tick in this process too; keep this source apart.
        let config =
            config(SourceEndpoint::new("metrics-test", 1)).with_stop_words(["the".to_string()]);

        let input = TestingInputConfig::new();
        input.push_batch(["the cat and the hat"]);
        let mut pipeline = worker::start(
            config.clone(),
            Box::new(InMemCheckpointStore::new()),
            &input,
            &TestingOutputConfig::new(),
            Box::new(TestingClock::new(
                Utc.timestamp_millis_opt(1_000).unwrap(),
            )),
        )
        .unwrap();
        pipeline
            .scheduler_mut()
            .step(Utc.timestamp_millis_opt(1_000).unwrap())
            .unwrap();

        let body = get(&config, "/metrics");
        assert!(body.starts_with("HTTP/1.1 200"), "{body}");
        let value = |name: &str| {
            body.lines()
                .find(|line| line.starts_with(name) && line.contains("metrics-test:1"))
                .and_then(|line| line.rsplit(' ').next())
                .map(String::from)
        };
        assert_eq!(
            value("wordstream_token_count").as_deref(),
            Some("3"),
            "{body}"
        );
        assert_eq!(
            value("wordstream_dropped_token_count").as_deref(),
            Some("2"),
            "{body}"
        );
    }
}
