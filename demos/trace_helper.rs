//! Example showing the function tracer with spans printed from an in-memory exporter

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::TracerProvider;
use openai_instrumentation::FnTracer;
use std::error::Error;
use std::time::Duration;

fn add(a: i32, b: i32) -> i32 {
    a + b
}

async fn slow_add(a: i32, b: i32) -> i32 {
    tokio::time::sleep(Duration::from_millis(10)).await;
    a + b
}

fn scale(value: f64, factor: f64) -> f64 {
    value * factor
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let exporter = InMemorySpanExporter::default();
    let provider = TracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();
    let tracer = FnTracer::new(provider.tracer("trace-helper-demo"));

    // Span named after the function
    let traced_add = tracer.trace(add)?;
    println!("add(1, 2) = {}", traced_add.call((1, 2)));

    // Explicit span name
    let traced_slow = tracer.trace_named("slow-add", slow_add)?;
    println!("slow_add(3, 4) = {}", traced_slow.call_async((3, 4)).await);

    // Scalar arguments recorded as span attributes
    let traced_scale = tracer.trace(scale)?.with_params(["value", "factor"]);
    println!("scale(2.5, 4.0) = {}", traced_scale.call_with_args((2.5, 4.0)));

    // Closures have no name to infer
    if let Err(e) = tracer.trace(|x: i32| x * 2) {
        println!("closure rejected: {}", e);
    }

    // Scoped spans, sync and async
    {
        let scope = tracer.span("sync-block");
        let _entered = scope.enter();
        traced_add.call((5, 6));
    }
    let scope = tracer.span("async-block");
    scope.instrument(traced_slow.call_async((7, 8))).await;
    drop(scope);

    for span in exporter.get_finished_spans()? {
        println!(
            "span {:<12} id={} parent={} attributes={:?}",
            span.name,
            span.span_context.span_id(),
            span.parent_span_id,
            span.attributes
        );
    }
    Ok(())
}
