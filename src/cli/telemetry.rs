//! Logging and optional OTLP trace export.

use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::TraceContextPropagator,
    trace::{SdkTracerProvider, Tracer},
};
use std::{env::var, time::Duration};
use tonic::transport::ClientTlsConfig;
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt};
use ulid::Ulid;

/// Set to `json` for one JSON object per event instead of pretty output.
pub const LOG_FORMAT_ENV: &str = "ENVERIFY_LOG_FORMAT";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const INSTANCE_ID_ENV: &str = "OTEL_SERVICE_INSTANCE_ID";

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(format) if format.trim().eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }

    fn layer(self) -> BoxedLayer {
        match self {
            Self::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(false)
                .boxed(),
            Self::Pretty => fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .with_target(false)
                .pretty()
                .boxed(),
        }
    }
}

/// OTLP/gRPC span export target. Endpoints without a scheme use TLS.
#[derive(Debug, PartialEq, Eq)]
struct SpanExport {
    endpoint: String,
    instance_id: String,
}

impl SpanExport {
    fn new(endpoint: &str, instance_id: Option<String>) -> Self {
        let endpoint = endpoint.trim().trim_end_matches('/');
        let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        };
        Self {
            endpoint,
            instance_id: instance_id.unwrap_or_else(|| Ulid::new().to_string()),
        }
    }

    fn uses_tls(&self) -> bool {
        self.endpoint.starts_with("https://")
    }

    fn resource(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("service.instance.id", self.instance_id.clone()),
            ])
            .build()
    }

    fn tracer(&self) -> Result<Tracer> {
        let mut builder = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&self.endpoint)
            .with_compression(Compression::Gzip)
            .with_timeout(Duration::from_secs(3));
        if self.uses_tls() {
            builder = builder.with_tls_config(ClientTlsConfig::new().with_native_roots());
        }

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(builder.build()?)
            .with_resource(self.resource())
            .build();

        let _ = TRACER_PROVIDER.set(provider.clone());
        global::set_tracer_provider(provider.clone());
        global::set_text_map_propagator(TraceContextPropagator::new());

        Ok(provider.tracer(env!("CARGO_PKG_NAME")))
    }
}

fn env_filter(level: Level) -> Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("tokio=error".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?))
}

/// Initialize logging, plus OTLP export when `OTEL_EXPORTER_OTLP_ENDPOINT`
/// is set.
///
/// # Errors
///
/// Returns an error if the exporter or the global subscriber cannot be set up.
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let format = LogFormat::parse(var(LOG_FORMAT_ENV).ok().as_deref());
    let filter = env_filter(verbosity_level.unwrap_or(Level::ERROR))?;

    let otel = match var(OTLP_ENDPOINT_ENV) {
        Ok(endpoint) => {
            let export = SpanExport::new(&endpoint, var(INSTANCE_ID_ENV).ok());
            Some(tracing_opentelemetry::layer().with_tracer(export.tracer()?))
        }
        Err(_) => None,
    };

    let subscriber = Registry::default()
        .with(format.layer())
        .with(otel)
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

/// Flush and stop the OTLP exporter, if one was started.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("shutting down tracer provider");
        let _ = provider.shutdown();
    }
}
