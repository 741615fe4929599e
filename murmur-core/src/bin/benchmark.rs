//! Drive full utterances through the decode orchestrator and report per-stage
//! timings as JSON.
//!
//! Runs on the in-process stub accelerator by default. With the `onnx`
//! feature, `--onnx <model_dir>` runs the real graphs instead.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use murmur_core::{
    Accelerator, BeamRearrangeRequest, DecodeOrchestrator, DecodeState, DecoderConfig,
    EmbeddingTable, ModelDims, ModelSize, StubAccelerator, TimingReport,
};
use ndarray::{Array2, Array3, Axis};
use serde::Serialize;
use tracing::info;

#[derive(Debug)]
struct Args {
    size: Option<ModelSize>,
    beam: Option<usize>,
    prompt: usize,
    steps: usize,
    utterances: usize,
    onnx_dir: Option<PathBuf>,
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    backend: String,
    dims: ModelDims,
    utterances: usize,
    prompt_tokens: usize,
    steps_per_utterance: usize,
    wall_ms: f64,
    ms_per_step: f64,
    timings: TimingReport,
}

/// Small enough for the stub to run in milliseconds.
fn toy_dims() -> ModelDims {
    ModelDims {
        n_mels: 8,
        n_audio_ctx: 32,
        n_state: 64,
        n_head: 4,
        n_layer: 2,
        n_vocab: 500,
        n_text_ctx: 64,
        max_prefill_ctx: 16,
        beam_size: 5,
        n_alignment_head: 2,
        logits_chunks: 5,
    }
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        size: None,
        beam: None,
        prompt: 3,
        steps: 20,
        utterances: 3,
        onnx_dir: None,
        output: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| it.next().ok_or_else(|| anyhow!("missing value for {flag}"));
        match arg.as_str() {
            "--size" => {
                let raw = value("--size")?;
                args.size = Some(ModelSize::parse(&raw).ok_or_else(|| anyhow!("unknown size: {raw}"))?);
            }
            "--beam" => args.beam = Some(value("--beam")?.parse().context("invalid value for --beam")?),
            "--prompt" => args.prompt = value("--prompt")?.parse().context("invalid value for --prompt")?,
            "--steps" => args.steps = value("--steps")?.parse().context("invalid value for --steps")?,
            "--utterances" => {
                args.utterances = value("--utterances")?
                    .parse::<usize>()
                    .context("invalid value for --utterances")?
                    .clamp(1, 100)
            }
            "--onnx" => args.onnx_dir = Some(PathBuf::from(value("--onnx")?)),
            "--output" => args.output = Some(PathBuf::from(value("--output")?)),
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p murmur-core --bin benchmark -- \\
  [--size tiny|base|small|medium|large] [--beam <n>] [--prompt <tokens>] \\
  [--steps <n>] [--utterances <n>] [--onnx <model_dir>] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn accelerator(args: &Args) -> anyhow::Result<Box<dyn Accelerator>> {
    match &args.onnx_dir {
        None => Ok(Box::new(StubAccelerator::new())),
        #[cfg(feature = "onnx")]
        Some(_) => Ok(Box::new(murmur_core::OnnxAccelerator::new())),
        #[cfg(not(feature = "onnx"))]
        Some(_) => bail!("--onnx requires the 'onnx' feature"),
    }
}

fn argmax(row: ndarray::ArrayView1<'_, f32>) -> u32 {
    row.iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0 as u32
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;

    let mut config = match args.size {
        Some(size) => DecoderConfig::for_size(size),
        None => DecoderConfig {
            dims: toy_dims(),
            ..DecoderConfig::default()
        },
    };
    if let Some(dir) = &args.onnx_dir {
        config.model_dir = dir.clone();
    }
    if let Some(beam) = args.beam {
        config.dims.beam_size = beam;
    }
    config.validate()?;
    let dims = config.dims.clone();
    if args.prompt == 0 || args.prompt > dims.max_prefill_ctx {
        bail!("--prompt must be in 1..={}", dims.max_prefill_ctx);
    }
    let steps = args.steps.min(dims.n_text_ctx - args.prompt);

    let accel = accelerator(&args)?;
    let mut orchestrator = DecodeOrchestrator::open(
        &config,
        accel.as_ref(),
        Box::new(EmbeddingTable::synthetic(&dims)),
    )?;

    info!(
        backend = accel.name(),
        utterances = args.utterances,
        prompt = args.prompt,
        steps,
        "running decode benchmark"
    );

    let beams = dims.beam_size;
    let mel = Array3::<f32>::ones((1, dims.n_mels, dims.n_mel_frames()));
    let started = Instant::now();
    for utterance in 0..args.utterances {
        let audio = orchestrator.encode(mel.view())?.to_owned();
        orchestrator.begin_utterance(audio.view())?;

        let prompt = Array2::from_shape_fn((beams, args.prompt), |(b, i)| {
            ((utterance + b + i * 7) % dims.n_vocab) as u32
        });
        let out = orchestrator.decode(prompt.view(), &DecodeState::prefill(beams))?;
        let mut state = out.next_state;
        let mut last = out.logits.index_axis(Axis(1), args.prompt - 1).to_owned();

        for _ in 0..steps {
            let next = Array2::from_shape_fn((beams, 1), |(b, _)| argmax(last.row(b)));
            let out = orchestrator.decode(next.view(), &state)?;
            state = out.next_state;
            last = out.logits.index_axis(Axis(1), 0).to_owned();

            // Rotate beams the way a pruning beam search would.
            let indices = (0..beams).map(|b| (b + 1) % beams).collect();
            orchestrator.rearrange(&BeamRearrangeRequest::new(indices, state.text_offset))?;
        }
    }
    let wall_ms = started.elapsed().as_secs_f64() * 1_000.0;
    orchestrator.instrumentation().log_summary();

    let total_steps = (args.utterances * steps).max(1);
    let summary = Summary {
        backend: accel.name().to_string(),
        dims,
        utterances: args.utterances,
        prompt_tokens: args.prompt,
        steps_per_utterance: steps,
        wall_ms,
        ms_per_step: wall_ms / total_steps as f64,
        timings: orchestrator.instrumentation().report(),
    };
    orchestrator.close();

    let json = serde_json::to_string_pretty(&summary)?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out, json).with_context(|| format!("writing {}", out.display()))?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=info".into()),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("benchmark failed: {e:#}");
        std::process::exit(1);
    }
}
