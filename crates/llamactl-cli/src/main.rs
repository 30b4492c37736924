use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use llamactl_backend::{ContainerRuntime, GpuSource};
use llamactl_backend_compose::{DockerCompose, HttpHealthProbe, NvidiaSmi};
use llamactl_common::{ControlConfig, ProfileSet};
use llamactl_core::{ControlPlane, ExitIntent};
use llamactl_obs::{HostSampler, PollerSettings, ResourcePoller};
use opentelemetry_otlp::WithExportConfig;
use serde_json::{json, Value};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "llamactl", version, about = "Control plane for a containerized llama.cpp server")]
struct Cli {
    /// Management API address; overrides the configured one
    #[arg(long, global = true)]
    api_addr: Option<SocketAddr>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane until interrupted or asked to stop
    Serve(ServeArgs),
    /// Switch the running server to another profile
    Switch { model: String },
    Status,
    Models,
    /// Stop the server and end `serve`
    Stop {
        /// Exit with the return-to-menu code instead of quit
        #[arg(long)]
        menu: bool,
    },
    /// Print one local host and GPU sample
    Stats,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Start this profile on launch
    #[arg(long, conflicts_with = "adopt")]
    model: Option<String>,
    /// Attach to an instance already started with this profile
    #[arg(long)]
    adopt: Option<String>,
    #[arg(long)]
    compose_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = ControlConfig::load().context("loading configuration")?;
    if let Some(addr) = cli.api_addr {
        config.api_addr = addr;
        config.validate()?;
    }
    match cli.command {
        Commands::Serve(args) => {
            let code = serve(config, args).await?;
            std::process::exit(code);
        }
        Commands::Switch { model } => switch(&config, &model).await,
        Commands::Status => status(&config).await,
        Commands::Models => models(&config).await,
        Commands::Stop { menu } => stop(&config, menu).await,
        Commands::Stats => stats(&config).await,
    }
}

fn gpu_source() -> Arc<dyn GpuSource> {
    #[cfg(feature = "nvidia")]
    if let Some(nvml) = llamactl_backend_compose::NvmlGpu::init() {
        return Arc::new(nvml);
    }
    Arc::new(NvidiaSmi::new())
}

async fn serve(mut config: ControlConfig, args: ServeArgs) -> anyhow::Result<i32> {
    if let Some(file) = args.compose_file {
        config.compose_file = file;
    }
    let profiles = ProfileSet::load(&config.profiles_file)
        .with_context(|| format!("loading profiles from {}", config.profiles_file.display()))?;
    tracing::info!(
        "{} profiles ({} benchmark)",
        profiles.len(),
        profiles.benchmark().count()
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCompose::new(
        config.compose_file.clone(),
        config.env_file_path(),
        config.service_name.clone(),
        config.log_tail,
    ));
    let health = Arc::new(HttpHealthProbe::new(config.health_url.clone()));
    let addr = config.api_addr;
    let poller_settings = PollerSettings::from_config(&config);
    let plane = ControlPlane::new(config, profiles, runtime.clone(), health);

    let poller = ResourcePoller::new(plane.store.clone(), runtime, gpu_source(), poller_settings)
        .spawn(plane.shutdown_token());

    // launch failures are already reflected in the store's status
    let launched = match (args.adopt.as_deref(), args.model.as_deref()) {
        (Some(id), _) => Some(plane.orchestrator.adopt(id)),
        (None, Some(id)) => Some(plane.orchestrator.switch_model(id)),
        (None, None) => None,
    };
    if let Some(Err(e)) = launched {
        tracing::warn!("initial model not started: {}", e);
    }

    let router = llamactl_api::app(plane.clone()).context("building metrics registry")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("listening on http://{}", addr);
    let stop_serving = plane.shutdown_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop_serving.cancelled().await })
            .await
    });

    let intent = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            ExitIntent::Quit
        }
        intent = plane.exit_requested() => intent,
    };
    let code = plane.shutdown(intent).await;

    let _ = poller.await;
    match server.await {
        Ok(Err(e)) => tracing::warn!("api server error: {}", e),
        Err(e) => tracing::warn!("api server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(code)
}

fn api_url(config: &ControlConfig, path: &str) -> String {
    format!("http://{}{}", config.api_addr, path)
}

async fn read_reply(resp: reqwest::Response) -> anyhow::Result<(reqwest::StatusCode, Value)> {
    let code = resp.status();
    let body = resp.json::<Value>().await.context("decoding response")?;
    Ok((code, body))
}

async fn get(config: &ControlConfig, path: &str) -> anyhow::Result<Value> {
    let resp = reqwest::get(api_url(config, path))
        .await
        .with_context(|| format!("no control plane at {} (is `llamactl serve` running?)", config.api_addr))?;
    let (code, body) = read_reply(resp).await?;
    if !code.is_success() {
        bail!("{path} returned HTTP {code}: {body}");
    }
    Ok(body)
}

async fn switch(config: &ControlConfig, model: &str) -> anyhow::Result<()> {
    let resp = reqwest::Client::new()
        .post(api_url(config, "/switch"))
        .json(&json!({ "model": model }))
        .send()
        .await
        .with_context(|| format!("no control plane at {}", config.api_addr))?;
    let (code, body) = read_reply(resp).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if code.as_u16() == 202 {
        println!("switch still in progress; check `llamactl status`");
    } else if !code.is_success() || body["success"] != true {
        bail!("switch to {model} did not complete");
    }
    Ok(())
}

async fn status(config: &ControlConfig) -> anyhow::Result<()> {
    let body = get(config, "/status").await?;
    let model = body["modelName"].as_str().unwrap_or("-");
    println!("state:  {}", body["state"].as_str().unwrap_or("unknown"));
    println!("model:  {}", model);
    if let Some(status) = body["status"].as_str().filter(|s| !s.is_empty()) {
        println!("status: {}", status);
    }
    Ok(())
}

async fn models(config: &ControlConfig) -> anyhow::Result<()> {
    let body = get(config, "/models").await?;
    for m in body.as_array().map(Vec::as_slice).unwrap_or_default() {
        let marker = if m["active"] == true { "*" } else { " " };
        let bench = if m["isBenchmark"] == true { " [bench]" } else { "" };
        println!(
            "{} {:<24} {:<32} ctx={:<8} {}{}",
            marker,
            m["id"].as_str().unwrap_or_default(),
            m["name"].as_str().unwrap_or_default(),
            m["contextSize"].as_str().unwrap_or_default(),
            m["speed"].as_str().unwrap_or_default(),
            bench
        );
    }
    Ok(())
}

async fn stop(config: &ControlConfig, menu: bool) -> anyhow::Result<()> {
    let intent = if menu { ExitIntent::ReturnToMenu } else { ExitIntent::Quit };
    let resp = reqwest::Client::new()
        .post(api_url(config, "/shutdown"))
        .json(&json!({ "intent": intent }))
        .send()
        .await
        .with_context(|| format!("no control plane at {}", config.api_addr))?;
    let (code, body) = read_reply(resp).await?;
    if !code.is_success() {
        bail!("shutdown returned HTTP {code}: {body}");
    }
    println!("shutdown requested (exit code {})", body["code"]);
    Ok(())
}

async fn stats(config: &ControlConfig) -> anyhow::Result<()> {
    let mut host = HostSampler::new();
    host.sample().await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    let h = host.sample().await;
    println!("CPU: {}%  load {:.2} {:.2} {:.2}", h.cpu_percent, h.load_avg_1, h.load_avg_5, h.load_avg_15);
    println!("Memory: {} / {} MiB", h.mem_used_mib, h.mem_total_mib);
    println!("Swap: {} / {} MiB", h.swap_used_mib, h.swap_total_mib);

    let gpus = tokio::time::timeout(Duration::from_secs(config.gpu_timeout_secs), gpu_source().query())
        .await
        .unwrap_or_default();
    if gpus.is_empty() {
        println!("GPU: none detected");
    }
    for g in gpus {
        println!(
            "GPU {} {}: {}% util, {} / {} MiB ({}%), {} C, {} / {} W",
            g.index,
            g.name,
            g.util_percent,
            g.mem_used_mib,
            g.mem_total_mib,
            g.mem_percent(),
            g.temp_c,
            g.power_draw_w,
            g.power_limit_w
        );
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
