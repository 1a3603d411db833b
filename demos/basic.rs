//! Basic example: trace chat completions and export the spans over OTLP

use dotenv::dotenv;
use futures::StreamExt;
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use openai_instrumentation::{
    CallKind, FnTracer, HttpConfig, InstrumentationConfig, OpenAIClient, OpenAIInstrumentor,
};
use serde_json::json;
use std::error::Error;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

fn setup_tracing(service_name: &str) -> Result<SdkMeterProvider, Box<dyn Error>> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4318/v1/traces".to_string());
    let metrics_endpoint = std::env::var("OTEL_EXPORTER_OTLP_METRICS_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4318/v1/metrics".to_string());
    let resource = Resource::new(vec![opentelemetry::KeyValue::new(
        "service.name",
        service_name.to_string(),
    )]);

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint.clone())
        .build()?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(resource.clone())
        .build();

    global::set_tracer_provider(tracer_provider);

    // Token usage counters
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(metrics_endpoint.clone())
        .build()?;
    let reader = PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio).build();
    let meter_provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(meter_provider.clone());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("openai_instrumentation=debug".parse()?),
        )
        .init();

    info!(
        "OpenTelemetry initialized, exporting traces to {} and metrics to {}",
        endpoint, metrics_endpoint
    );
    Ok(meter_provider)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    let meter_provider = setup_tracing("openai-instrumentation-demo")?;

    let client = OpenAIClient::http(HttpConfig::from_env()?)?;
    let config = InstrumentationConfig::from_env()?;
    let instrumentor = OpenAIInstrumentor::from_config(CallKind::ALL, &config);
    instrumentor.instrument(&client);

    let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let tracer = FnTracer::from_config(&config);
    let scope = tracer.span("demo");

    scope
        .instrument(async {
            let args = json!({
                "model": model,
                "messages": [{"role": "user", "content": "Say hello in one word"}],
                "temperature": 0.7,
                "max_tokens": 10
            });
            let reply = client
                .chat_completion
                .acreate(args.as_object().ok_or("arguments must be an object")?)
                .await?;
            if let Some(response) = reply.into_complete() {
                info!("Response: {}", response["choices"][0]["message"]["content"]);
            }

            let args = json!({
                "model": model,
                "messages": [{"role": "user", "content": "Count to five"}],
                "stream": true
            });
            let reply = client
                .chat_completion
                .acreate(args.as_object().ok_or("arguments must be an object")?)
                .await?;
            if let Some(mut chunks) = reply.into_stream() {
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;
                    if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
                        print!("{}", content);
                    }
                }
                println!();
            }
            Ok::<_, Box<dyn Error>>(())
        })
        .await?;
    drop(scope);

    instrumentor.uninstrument(&client);

    info!("Exporting traces and metrics...");
    sleep(Duration::from_secs(2)).await;
    meter_provider.shutdown()?;
    global::shutdown_tracer_provider();

    Ok(())
}
