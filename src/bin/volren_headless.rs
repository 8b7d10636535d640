// src/bin/volren_headless.rs
//! Headless demo: renders a synthetic two-volume scene through every
//! interpreter and sampler and optionally writes the last frame as a PPM.
//!
//! ```text
//! volren-headless [--gpu] [--size N] [--out frame.ppm]
//! ```

use anyhow::{bail, Context, Result};
use cgmath::{InnerSpace, Matrix4, SquareMatrix, Vector3, Vector4};
use std::io::Write;
use std::thread;
use volren::prelude::*;
use volren::renderer::RenderBackend;

struct Options {
    gpu: bool,
    size: u32,
    out: Option<String>,
}

fn parse_args() -> Result<Options> {
    let mut options = Options {
        gpu: false,
        size: 128,
        out: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--gpu" => options.gpu = true,
            "--size" => {
                let value = args.next().context("--size needs a value")?;
                options.size = value.parse().with_context(|| format!("invalid size '{}'", value))?;
            }
            "--out" => options.out = Some(args.next().context("--out needs a path")?),
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(options)
}

fn build_scene<B: RenderBackend>(renderer: &mut MultiVolumeRenderer<B>) -> Result<()> {
    let center = Vector3::new(0.5, 0.5, 0.5);
    let ball = Volume::from_fn("ball", [64, 64, 64], Matrix4::identity(), |p| {
        (1.0 - (p - center).magnitude() * 2.0).max(0.0)
    })?;
    let shell = Volume::from_fn(
        "shell",
        [48, 48, 48],
        Matrix4::from_translation(Vector3::new(0.35, 0.0, 0.0)),
        |p| {
            let r = (p - center).magnitude();
            (-((r - 0.3) * 12.0).powi(2)).exp()
        },
    )?;
    renderer.add_volume(VolumeId(0), ball).context("adding ball")?;
    renderer.add_volume(VolumeId(1), shell).context("adding shell")?;

    renderer.update_transfer_function(vec![
        ControlPoint::new(0.0, Vector4::new(0.0, 0.0, 0.0, 0.0)),
        ControlPoint::new(0.3, Vector4::new(0.1, 0.2, 0.8, 0.05)),
        ControlPoint::new(0.7, Vector4::new(0.9, 0.5, 0.1, 0.3)),
        ControlPoint::new(1.0, Vector4::new(1.0, 1.0, 0.9, 0.8)),
    ])?;
    Ok(())
}

fn write_ppm(path: &str, frame: &FrameBuffer) -> Result<()> {
    let mut file = std::fs::File::create(path).with_context(|| format!("creating {}", path))?;
    writeln!(file, "P6\n{} {}\n255", frame.width(), frame.height())?;
    let rgb: Vec<u8> = frame
        .to_rgba8()
        .chunks_exact(4)
        .flat_map(|p| [p[0], p[1], p[2]])
        .collect();
    file.write_all(&rgb)?;
    Ok(())
}

fn run<B: RenderBackend>(backend: B, options: &Options) -> Result<()> {
    let settings = RenderSettings::default()
        .with_step_size(0.005)
        .with_background(Vector4::new(0.05, 0.05, 0.08, 1.0));
    let mut renderer = MultiVolumeRenderer::new(backend, settings)?;
    build_scene(&mut renderer)?;

    let camera = Camera::perspective(Vector3::new(0.7, 1.2, 2.6), Vector3::new(0.67, 0.5, 0.5));
    let viewport = Viewport::new(options.size, options.size);

    let passes = [
        (VolumeInterpreter::Transparent, Sampler::Regular),
        (VolumeInterpreter::Transparent, Sampler::PreIntegrated),
        (VolumeInterpreter::IsoSurface, Sampler::Regular),
    ];
    for (interpreter, sampler) in passes {
        renderer.set_volume_interpreter(interpreter);
        renderer.set_transfer_function_sampler(sampler);
        let report = renderer.render_frame(&camera, viewport)?;
        log::info!(
            "{} / {}: {:.2}ms, rebuilt {}",
            interpreter.label(),
            sampler.label(),
            report.metrics.frame_time_ms,
            report.rebuilt
        );
    }

    // Configuration changes from another thread land at the next frame boundary.
    let controller = renderer.controller();
    let worker = thread::spawn(move || -> volren::Result<()> {
        let max = controller.global_max_volume_value();
        controller.set_iso_value(max * 0.6)?;
        controller.set_aggregation_config(AggregationConfig::new(AggregationRule::Sum))
    });
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("controller thread panicked"))??;
    let report = renderer.render_frame(&camera, viewport)?;
    log::info!(
        "after controller update: iso {:.3}, program {}",
        renderer.iso_value(),
        report.program_key
    );

    let metrics = renderer.metrics();
    log::info!(
        "{} frames, {} rebuilds, {:.1} samples/ray",
        metrics.frames,
        metrics.rebuilds,
        metrics.samples_per_ray()
    );
    if let Some(path) = &options.out {
        write_ppm(path, &report.frame)?;
        log::info!("Wrote {}", path);
    }
    renderer.shutdown();
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = parse_args()?;

    if options.gpu {
        let backend = WgpuBackend::new().context("no usable GPU adapter")?;
        log::info!("Rendering on {}", backend.adapter_name());
        run(backend, &options)
    } else {
        run(CpuBackend::new(), &options)
    }
}
