use clap::Parser;
use std::path::PathBuf;

use crate::chart::Difficulty;

#[derive(Parser, Debug)]
#[command(name = "beatforge", about = "Rhythm-game chart generator: onsets, tempo and song structure from audio")]
pub struct Cli {
    /// Input audio files (WAV, MP3, FLAC, OGG). Several files are analyzed in parallel.
    pub inputs: Vec<PathBuf>,

    /// Output JSON file (single input only). Defaults to <input>.chart.json
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Chart difficulty
    #[arg(short, long, value_enum, default_value_t = Difficulty::Normal)]
    pub difficulty: Difficulty,

    /// Known tempo in BPM; skips tempo estimation when inside the BPM range
    #[arg(long)]
    pub bpm: Option<f32>,

    /// Confidence attached to --bpm (0.0-1.0)
    #[arg(long, default_value_t = 0.9)]
    pub hint_confidence: f32,

    /// First-beat offset in seconds attached to --bpm
    #[arg(long, default_value_t = 0.0)]
    pub hint_offset: f32,

    /// JSON tempo hint ({"bpm", "confidence", "firstBeatOffset"}) written by an external estimator
    #[arg(long)]
    pub hint_file: Option<PathBuf>,

    /// Milliseconds to wait for --hint-file before estimating internally
    #[arg(long, default_value_t = 300)]
    pub hint_timeout_ms: u64,

    /// Pattern catalog JSON replacing built-in templates per section type
    #[arg(long)]
    pub patterns: Option<PathBuf>,

    /// Config file (TOML). Defaults to ./beatforge.toml or ~/.config/beatforge/config.toml
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Fixed onset sensitivity instead of the difficulty-driven sweep
    #[arg(long)]
    pub sensitivity: Option<f32>,

    /// Write the raw analysis (beats, onsets, sections, spectral) instead of a chart
    #[arg(long)]
    pub analysis_only: bool,

    /// List pattern templates per section type and exit
    #[arg(long)]
    pub list_patterns: bool,
}
