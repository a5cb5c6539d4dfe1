mod audio;
mod chart;
mod cli;
mod config;
mod error;
mod hint;
mod patterns;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use audio::analysis::{analyze_track, AnalysisSettings};
use audio::context::AnalysisContext;
use audio::decode::decode_waveform;
use audio::features::{TempoHint, Waveform};
use chart::{build_chart, Difficulty};
use cli::Cli;
use hint::{NoHint, StaticHint, TempoHintProvider, TimedHint};
use patterns::catalog::list_patterns;
use patterns::PatternCatalog;
use worker::{GenerateRequest, Worker};

const STAGES: [&str; 4] = ["tempo", "onsets", "sections", "spectral"];

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut cli = Cli::parse();

    // Load config: explicit --config path, or auto-detect beatforge.toml / global config
    let config_path = cli.config.clone().or_else(|| {
        let local = PathBuf::from("beatforge.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("beatforge").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("beatforge").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    });
    let mut settings = AnalysisSettings::default();
    if let Some(ref path) = config_path {
        if let Some(cfg) = config::load_config(path) {
            log::info!("Loaded config from {}", path.display());
            // Merge: config values apply only when CLI is at its default
            if cli.difficulty == Difficulty::Normal { cli.difficulty = cfg.chart.difficulty; }
            if cli.hint_timeout_ms == 300 { cli.hint_timeout_ms = cfg.analysis.hint_timeout_ms; }
            if cli.patterns.is_none() { cli.patterns = cfg.chart.patterns; }
            settings = cfg.analysis.settings;
        }
    }
    if cli.sensitivity.is_some() {
        settings.sensitivity = cli.sensitivity;
    }
    settings.validate().context("Invalid analysis settings")?;

    let catalog = match cli.patterns {
        Some(ref path) => PatternCatalog::load(path)
            .with_context(|| format!("Failed to load patterns: {}", path.display()))?,
        None => PatternCatalog::builtin().context("Built-in pattern catalog is invalid")?,
    };

    // List patterns mode
    if cli.list_patterns {
        println!("Pattern templates ({} lanes):", catalog.lanes());
        for (kind, names) in list_patterns(&catalog) {
            println!("  {:<10} {}", kind.name(), names.join(", "));
        }
        return Ok(());
    }

    if cli.inputs.is_empty() {
        anyhow::bail!("Input audio file is required");
    }
    if cli.output.is_some() && cli.inputs.len() > 1 {
        anyhow::bail!("--output only applies to a single input");
    }

    if cli.inputs.len() == 1 && !cli.analysis_only {
        let input = &cli.inputs[0];
        let output = cli.output.clone().unwrap_or_else(|| output_path(input, false));
        return generate_single(&cli, input, &output, settings, catalog);
    }

    // Batch: one analysis context per file
    log::info!("Analyzing {} file(s)...", cli.inputs.len());
    let failures: Vec<(PathBuf, anyhow::Error)> = cli
        .inputs
        .par_iter()
        .filter_map(|input| {
            let output = match cli.output {
                Some(ref o) => o.clone(),
                None => output_path(input, cli.analysis_only),
            };
            process_file(&cli, input, &output, &settings, &catalog)
                .err()
                .map(|e| (input.clone(), e))
        })
        .collect();

    for (input, e) in &failures {
        log::error!("{}: {:#}", input.display(), e);
    }
    if !failures.is_empty() {
        anyhow::bail!("{} of {} file(s) failed", failures.len(), cli.inputs.len());
    }
    log::info!("Done!");
    Ok(())
}

fn output_path(input: &Path, analysis_only: bool) -> PathBuf {
    let suffix = if analysis_only { "analysis.json" } else { "chart.json" };
    input.with_extension(suffix)
}

fn hint_provider(cli: &Cli) -> Box<dyn TempoHintProvider> {
    if let Some(bpm) = cli.bpm {
        return Box::new(StaticHint(TempoHint {
            bpm,
            confidence: cli.hint_confidence,
            first_beat_offset: cli.hint_offset,
        }));
    }
    match cli.hint_file {
        Some(ref path) => {
            let path = path.clone();
            Box::new(TimedHint::new(
                move |_: &Waveform| {
                    let text = std::fs::read_to_string(&path)
                        .map_err(|e| log::warn!("Tempo hint unavailable ({}): {}", path.display(), e))
                        .ok()?;
                    serde_json::from_str::<TempoHint>(&text)
                        .map_err(|e| log::warn!("Malformed tempo hint {}: {}", path.display(), e))
                        .ok()
                },
                Duration::from_millis(cli.hint_timeout_ms),
            ))
        }
        None => Box::new(NoHint),
    }
}

/// One file through the analysis worker, with a progress bar.
fn generate_single(
    cli: &Cli,
    input: &Path,
    output: &Path,
    settings: AnalysisSettings,
    catalog: PatternCatalog,
) -> Result<()> {
    log::info!("Decoding {}...", input.display());
    let waveform = decode_waveform(input)?;

    let worker = Worker::spawn(settings, catalog, hint_provider(cli))
        .context("Failed to start analysis worker")?;

    let pb = ProgressBar::new(100 * STAGES.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {msg:<10} ({eta} remaining)")?
            .progress_chars("=>-"),
    );

    let request = GenerateRequest {
        id: 1,
        difficulty: cli.difficulty,
        sample_rate: waveform.sample_rate,
        length: waveform.length,
        duration: waveform.duration,
        channels: waveform.channels,
        perf_hint: None,
        use_tempo_hint: true,
    };
    let chart = worker.generate(request, |stage, progress| {
        let index = STAGES.iter().position(|s| *s == stage).unwrap_or(0);
        pb.set_message(stage.to_string());
        pb.set_position((index as f32 * 100.0 + progress.clamp(0.0, 1.0) * 100.0) as u64);
    })?;
    pb.finish_with_message("done");

    let json = serde_json::to_string_pretty(&chart)?;
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write chart: {}", output.display()))?;

    log::info!(
        "Done! {} notes at {:.1} BPM ({}): {}",
        chart.notes.len(),
        chart.bpm,
        chart.difficulty,
        output.display()
    );
    Ok(())
}

fn process_file(
    cli: &Cli,
    input: &Path,
    output: &Path,
    settings: &AnalysisSettings,
    catalog: &PatternCatalog,
) -> Result<()> {
    let waveform = Arc::new(decode_waveform(input)?);
    let mut settings = settings.clone();
    if settings.sensitivity.is_none() {
        settings.target_onset_rate = cli.difficulty.target_onset_rate();
    }

    let hint = hint_provider(cli).try_get_hint(Arc::clone(&waveform));
    let mut ctx = AnalysisContext::new();
    let analysis = analyze_track(&mut ctx, &waveform, &settings, hint, &mut |_, _| {})
        .with_context(|| format!("Analysis failed: {}", input.display()))?;

    let json = if cli.analysis_only {
        serde_json::to_string_pretty(&analysis)?
    } else {
        serde_json::to_string_pretty(&build_chart(&analysis, catalog, cli.difficulty))?
    };
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write output: {}", output.display()))?;

    log::info!("{} -> {}", input.display(), output.display());
    Ok(())
}
