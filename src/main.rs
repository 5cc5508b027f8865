use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use echoalign::align::{AlignOptions, Propagation};
use echoalign::config::{CorrelationConfig, FingerprintConfig, Technique};
use echoalign::peaks::find_peaks_2d;
use echoalign::results::{Alignment, Recognition, write_json};
use echoalign::spectrogram::Spectrogram;
use echoalign::{Engine, Error, Recognizer, audio, visualize};

/// Exit status for a run stopped by Ctrl+C.
const INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "echoalign", about = "Recognize and align audio recordings")]
struct Cli {
    /// Worker threads (defaults to the number of cores)
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct RecognizerArgs {
    /// fingerprints, correlation or correlation_spectrogram
    #[arg(long, short, default_value = "fingerprints")]
    technique: String,
    /// Fingerprint accuracy, 1 (fast) to 4 (thorough)
    #[arg(long, default_value_t = 2)]
    accuracy: u8,
    /// base, panako_mod, panako or base_three
    #[arg(long)]
    hash_style: Option<String>,
    /// Locality window in seconds
    #[arg(long)]
    locality: Option<f64>,
    #[arg(long)]
    sample_rate: Option<u32>,
    /// Minimum match strength; pins the fingerprint filter
    #[arg(long)]
    filter: Option<f64>,
    /// Maximum searched offset in seconds (correlation only)
    #[arg(long)]
    max_lags: Option<f64>,
    /// Frequency threshold in Hz
    #[arg(long)]
    freq_threshold: Option<f64>,
}

impl RecognizerArgs {
    fn fingerprint_config(&self) -> echoalign::Result<FingerprintConfig> {
        let mut config = FingerprintConfig::default().with_accuracy(self.accuracy)?;
        if let Some(style) = &self.hash_style {
            config.set_hash_style(style);
        }
        config.locality = self.locality;
        config.filter_matches = self.filter.map(|f| f.max(0.0).round() as usize);
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(freq) = self.freq_threshold {
            config.freq_threshold = freq;
        }
        config.validate()?;
        Ok(config)
    }

    fn correlation_config(&self) -> echoalign::Result<CorrelationConfig> {
        let mut config = CorrelationConfig {
            locality: self.locality,
            max_lags: self.max_lags,
            ..Default::default()
        };
        if let Some(filter) = self.filter {
            config.filter_matches = filter;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(freq) = self.freq_threshold {
            config.freq_threshold = freq;
        }
        config.validate()?;
        Ok(config)
    }

    fn recognizer(&self) -> echoalign::Result<Recognizer> {
        Ok(match self.technique.parse::<Technique>()? {
            Technique::Fingerprints => Recognizer::Fingerprint(self.fingerprint_config()?),
            Technique::Correlation => Recognizer::Correlation(self.correlation_config()?),
            Technique::CorrelationSpectrogram => {
                Recognizer::CorrelationSpectrogram(self.correlation_config()?)
            }
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fingerprint files or directories and save the corpus
    Fingerprint {
        inputs: Vec<PathBuf>,
        /// .json, .db or .sqlite output
        #[arg(long)]
        save: PathBuf,
        /// Merge an existing corpus first
        #[arg(long)]
        load: Option<PathBuf>,
        #[arg(long, default_value_t = 2)]
        accuracy: u8,
        #[arg(long)]
        hash_style: Option<String>,
    },
    /// Find where a target occurs in other recordings
    Recognize {
        target: PathBuf,
        /// File or directory to compare against
        #[arg(long)]
        against: Option<PathBuf>,
        /// Saved fingerprints to recognize against
        #[arg(long)]
        fingerprints: Option<PathBuf>,
        #[command(flatten)]
        recognizer: RecognizerArgs,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Compute per-file shifts that line up every recording in a directory
    Align {
        dir: PathBuf,
        /// Use this file as the reference
        #[arg(long)]
        target: Option<PathBuf>,
        /// Refine the coarse alignment with a second pass
        #[arg(long)]
        fine: bool,
        /// Chain matches through any number of intermediate files
        #[arg(long)]
        graph: bool,
        #[command(flatten)]
        recognizer: RecognizerArgs,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Render a spectrogram with its fingerprint peaks as an image
    Spectrogram {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = 2)]
        accuracy: u8,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match interrupted_after(&err) {
            Some(elapsed) => {
                eprintln!(
                    "Interrupted after {:.2}s, partial results discarded",
                    elapsed.as_secs_f64()
                );
                ExitCode::from(INTERRUPTED)
            }
            None => {
                eprintln!("Error: {err:?}");
                ExitCode::from(1)
            }
        },
    }
}

/// How long the interrupted batch ran, if `err` is a cancellation.
fn interrupted_after(err: &anyhow::Error) -> Option<Duration> {
    match err.downcast_ref::<Error>() {
        Some(Error::Cancelled { elapsed }) => Some(*elapsed),
        _ => None,
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut engine = Engine::new(cli.workers);

    let cancel = engine.cancel_token();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, cancelling");
        cancel.cancel();
    })
    .context("installing Ctrl+C handler")?;

    match cli.command {
        Commands::Fingerprint {
            inputs,
            save,
            load,
            accuracy,
            hash_style,
        } => {
            let mut config = FingerprintConfig::default().with_accuracy(accuracy)?;
            if let Some(style) = hash_style {
                config.set_hash_style(&style);
            }
            if let Some(load) = load {
                engine
                    .load_fingerprints(&load)
                    .with_context(|| format!("loading {}", load.display()))?;
            }
            for input in &inputs {
                if input.is_dir() {
                    engine.fingerprint_directory(input, &config)?;
                } else {
                    engine.fingerprint_files(std::slice::from_ref(input), &config)?;
                }
            }
            engine
                .save_fingerprints(&save)
                .with_context(|| format!("saving {}", save.display()))?;
            println!(
                "{} files, {} fingerprints -> {}",
                engine.corpus().len(),
                engine.corpus().total_fingerprints(),
                save.display()
            );
        }
        Commands::Recognize {
            target,
            against,
            fingerprints,
            recognizer,
            output,
        } => {
            let recognizer = recognizer.recognizer()?;
            if let Some(path) = fingerprints {
                engine.load_fingerprints(&path)?;
            }
            let recognition = engine.recognize(&target, against.as_deref(), &recognizer)?;
            print_recognition(&target, recognition.as_ref());
            if let (Some(output), Some(recognition)) = (output, recognition) {
                write_json(&recognition, &output)?;
            }
        }
        Commands::Align {
            dir,
            target,
            fine,
            graph,
            recognizer,
            output,
        } => {
            let recognizer = recognizer.recognizer()?;
            let options = AlignOptions {
                propagation: if graph {
                    Propagation::Graph
                } else {
                    Propagation::SingleHop
                },
                destination: if fine { None } else { output.clone() },
            };
            let coarse = match &target {
                Some(target) => engine.target_align(target, &dir, &recognizer, &options)?,
                None => engine.align(&dir, &recognizer, &options)?,
            };
            let Some(coarse) = coarse else {
                println!("No matches detected");
                return Ok(());
            };
            let alignment = if fine {
                let options = AlignOptions {
                    destination: output,
                    ..options
                };
                engine.fine_align(&coarse, &recognizer, &options)?
            } else {
                coarse
            };
            print_alignment(&alignment);
        }
        Commands::Spectrogram {
            input,
            output,
            accuracy,
        } => render_spectrogram(&input, &output, accuracy)?,
    }
    Ok(())
}

fn render_spectrogram(input: &Path, output: &Path, accuracy: u8) -> Result<()> {
    let config = FingerprintConfig::default().with_accuracy(accuracy)?;
    let signal = audio::read(input, config.sample_rate, None)?;
    let spectrogram = Spectrogram::compute(
        &signal.samples,
        config.sample_rate,
        config.window_size,
        config.overlap_ratio,
    );
    let peaks = find_peaks_2d(
        &spectrogram.thresholded(config.freq_threshold),
        config.peak_neighborhood_size,
        config.amp_min,
        config.peak_sort,
    );
    visualize::save_spectrogram(&spectrogram, &peaks, output)?;
    println!("{} peaks -> {}", peaks.len(), output.display());
    Ok(())
}

fn print_recognition(target: &Path, recognition: Option<&Recognition>) {
    let Some(recognition) = recognition else {
        println!("{}: no matches", target.display());
        return;
    };
    println!(
        "{}: {} match(es) in {:.2}s",
        target.display(),
        recognition.match_info.len(),
        recognition.match_time
    );
    for (name, file_match) in &recognition.match_info {
        println!(
            "  {name}: offset {:.3}s, confidence {:.2}, rank {}",
            file_match.best_offset_seconds().unwrap_or_default(),
            file_match.best_confidence(),
            recognition.rankings.get(name).copied().unwrap_or_default()
        );
    }
}

fn print_alignment(alignment: &Alignment) {
    println!("Shifts (seconds of leading silence):");
    for (name, shift) in &alignment.shifts {
        println!("  {name}: {shift:.3}");
    }
}
