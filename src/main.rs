// Example runner: finds a template in a single captured frame.
//
//   lure_vision <frame.png> <template.png> [config.json] [crop-out.png]
//
// Logging follows RUST_LOG; set LOG_FORMAT=json for structured output.

use lure_vision::core_modules::utils::image_helper::image_helper::{load_frame, save_frame};
use lure_vision::{Config, Rect, VisionResult, detect};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lure_vision=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn run(args: &[String]) -> VisionResult<bool> {
    let frame = load_frame(&args[1])?;
    let template = load_frame(&args[2])?;
    let config = match args.get(3) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    info!(
        frame_width = frame.width(),
        frame_height = frame.height(),
        template_width = template.width(),
        template_height = template.height(),
        "searching"
    );

    let result = detect(&frame, &template, &config).await;
    match (result.position, result.center()) {
        (Some((x, y)), Some((cx, cy))) => println!(
            "found={} score={:.4} scale={:.3} top_left=({x}, {y}) center=({cx}, {cy}) size={}x{} scales={}",
            result.found, result.score, result.scale, result.width, result.height, result.scales_evaluated
        ),
        _ => println!(
            "found=false score={:.4} scales={}",
            result.score, result.scales_evaluated
        ),
    }

    if let (Some(out), Some((x, y))) = (args.get(4), result.position) {
        let crop = frame.crop(Rect::new(x, y, result.width, result.height));
        save_frame(out, &crop)?;
        info!(path = %out, "matched region saved");
    }
    Ok(result.found)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        let program = args.first().map(String::as_str).unwrap_or("lure_vision");
        eprintln!("usage: {program} <frame.png> <template.png> [config.json] [crop-out.png]");
        return ExitCode::from(2);
    }

    match run(&args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!(error = %err, "detection failed");
            ExitCode::from(2)
        }
    }
}
