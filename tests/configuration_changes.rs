//! Program lifecycle, last-good fallback and cross-thread configuration

mod common;

use cgmath::Vector4;
use common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use volren::aggregation::ActiveVolume;
use volren::prelude::*;
use volren::renderer::{FrameInputs, FrameOutput};
use volren::shader::{ComposedShader, ShaderVariant};
use volren::transfer_function::TransferFunctionTables;

fn renderer_with_volume() -> MultiVolumeRenderer<CpuBackend> {
    let mut renderer = cpu_renderer(RenderSettings::default().with_step_size(0.1));
    renderer.add_volume(VolumeId(0), unit_uniform(0.5)).expect("add");
    renderer
}

#[test]
fn test_broken_custom_rule_keeps_last_good_program() {
    init_logging();
    let mut renderer = renderer_with_volume();
    let camera = front_camera(0.5);
    let viewport = Viewport::new(3, 3);
    let good = renderer.render_frame(&camera, viewport).expect("frame");

    let broken = CustomRule::new("broken", "fn aggregate_init() -> vec2<f32> { return vec2<f32>(0.0); }", |s| {
        s.first().map(|c| c.value)
    });
    renderer
        .set_aggregation_config(AggregationConfig::new(AggregationRule::Custom(broken)))
        .expect("config itself is valid");

    let fallback = renderer.render_frame(&camera, viewport).expect("last good program draws");
    assert!(!fallback.rebuilt);
    assert!(matches!(
        fallback.config_error,
        Some(VolumeRenderError::ShaderCompilation { .. })
    ));
    assert_eq!(fallback.program_key, good.program_key);
    assert_eq!(fallback.frame, good.frame);
    assert!(renderer.controller().status().last_error.is_some());

    // The failed variant is not recompiled every frame.
    let again = renderer.render_frame(&camera, viewport).expect("frame");
    assert!(again.config_error.is_some());
    assert_eq!(renderer.backend().compiled_programs(), 1);

    // Restoring the working rule needs no rebuild either.
    renderer
        .set_aggregation_config(AggregationConfig::new(AggregationRule::Maximum))
        .expect("valid config");
    let restored = renderer.render_frame(&camera, viewport).expect("frame");
    assert!(!restored.rebuilt);
    assert!(restored.config_error.is_none());
}

const CONSTANT_FOLD_WGSL: &str = "
fn aggregate_init() -> vec2<f32> { return vec2<f32>(0.0, 0.0); }
fn aggregate_step(acc: vec2<f32>, value: f32, weight: f32) -> vec2<f32> { return acc; }
fn aggregate_finish(acc: vec2<f32>, count: u32) -> f32 { return acc.x; }
";

#[test]
fn test_replacing_custom_rule_with_same_name_rebuilds() {
    init_logging();
    let mut renderer = renderer_with_volume();
    let camera = front_camera(0.5);
    let viewport = Viewport::new(3, 3);

    let empty = CustomRule::new("user", CONSTANT_FOLD_WGSL, |_| Some(0.0));
    renderer
        .set_aggregation_config(AggregationConfig::new(AggregationRule::Custom(empty)))
        .expect("valid config");
    let first = renderer.render_frame(&camera, viewport).expect("frame");
    assert!(first.rebuilt);

    let dense = CustomRule::new("user", CONSTANT_FOLD_WGSL, |_| Some(1.0));
    renderer
        .set_aggregation_config(AggregationConfig::new(AggregationRule::Custom(dense)))
        .expect("valid config");
    let second = renderer.render_frame(&camera, viewport).expect("frame");

    assert!(second.rebuilt);
    assert_ne!(second.program_key, first.program_key);
    assert_eq!(first.frame.pixel(1, 1), Some([0.0, 0.0, 0.0, 0.0]));
    assert_ne!(second.frame.pixel(1, 1), first.frame.pixel(1, 1));
}

/// CPU backend whose compilation can be made to fail from the test
struct FlakyBackend {
    inner: CpuBackend,
    fail: Arc<AtomicBool>,
}

impl RenderBackend for FlakyBackend {
    type Program = <CpuBackend as RenderBackend>::Program;

    fn name(&self) -> &str {
        "flaky"
    }

    fn compile(&mut self, shader: &ComposedShader, variant: &ShaderVariant) -> volren::Result<Self::Program> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VolumeRenderError::ShaderCompilation {
                label: shader.label.clone(),
                message: "driver rejected the module".into(),
            });
        }
        self.inner.compile(shader, variant)
    }

    fn bind_volumes(&mut self, volumes: &[ActiveVolume]) -> volren::Result<()> {
        self.inner.bind_volumes(volumes)
    }

    fn upload_transfer_function(&mut self, tables: &TransferFunctionTables, sampler: Sampler) -> volren::Result<()> {
        self.inner.upload_transfer_function(tables, sampler)
    }

    fn draw(&mut self, program: &Self::Program, inputs: &FrameInputs<'_>) -> volren::Result<FrameOutput> {
        self.inner.draw(program, inputs)
    }

    fn release(&mut self) {
        self.inner.release()
    }
}

#[test]
fn test_backend_compile_failure_falls_back() {
    init_logging();
    let fail = Arc::new(AtomicBool::new(false));
    let backend = FlakyBackend {
        inner: CpuBackend::new(),
        fail: fail.clone(),
    };
    let mut renderer = MultiVolumeRenderer::new(backend, RenderSettings::default().with_step_size(0.1))
        .expect("valid settings");
    let camera = front_camera(0.5);
    let viewport = Viewport::new(2, 2);

    // Nothing has been built yet, so a failure leaves nothing to draw with.
    fail.store(true, Ordering::SeqCst);
    let err = renderer.render_frame(&camera, viewport).expect_err("no program");
    assert!(matches!(err, VolumeRenderError::NoRenderableState { .. }));

    fail.store(false, Ordering::SeqCst);
    renderer.add_volume(VolumeId(0), unit_uniform(0.5)).expect("add");
    let good = renderer.render_frame(&camera, viewport).expect("frame");
    assert!(good.rebuilt);

    fail.store(true, Ordering::SeqCst);
    renderer.set_volume_interpreter(VolumeInterpreter::IsoSurface);
    let fallback = renderer.render_frame(&camera, viewport).expect("frame");
    assert!(fallback.config_error.is_some());
    assert_eq!(fallback.frame, good.frame);
    assert_eq!(renderer.session().map(|s| s.variant().interpreter), Some(VolumeInterpreter::Transparent));

    // Any further configuration change retries the build.
    fail.store(false, Ordering::SeqCst);
    renderer.set_transfer_function_sampler(Sampler::PreIntegrated);
    let rebuilt = renderer.render_frame(&camera, viewport).expect("frame");
    assert!(rebuilt.rebuilt);
    assert!(rebuilt.config_error.is_none());
    assert_eq!(renderer.session().map(|s| s.variant().interpreter), Some(VolumeInterpreter::IsoSurface));
}

#[test]
fn test_removed_volume_stays_bound_while_falling_back() {
    let fail = Arc::new(AtomicBool::new(false));
    let backend = FlakyBackend {
        inner: CpuBackend::new(),
        fail: fail.clone(),
    };
    let mut renderer = MultiVolumeRenderer::new(backend, RenderSettings::default().with_step_size(0.1))
        .expect("valid settings");
    renderer.add_volume(VolumeId(0), unit_uniform(0.5)).expect("add");
    renderer.add_volume(VolumeId(1), unit_uniform(0.8)).expect("add");
    let good = renderer.render_frame(&front_camera(0.5), Viewport::new(2, 2)).expect("frame");

    fail.store(true, Ordering::SeqCst);
    renderer.remove_volume(VolumeId(1)).expect("remove");
    let fallback = renderer.render_frame(&front_camera(0.5), Viewport::new(2, 2)).expect("frame");
    assert!(fallback.config_error.is_some());
    assert_eq!(fallback.frame, good.frame);
    assert_eq!(renderer.backend().inner.bound_volumes(), vec![VolumeId(0), VolumeId(1)]);
}

#[test]
fn test_controller_batches_apply_at_frame_boundary() {
    init_logging();
    let mut renderer = cpu_renderer(RenderSettings::default().with_step_size(0.1));
    let controller = renderer.controller();

    let handles: Vec<_> = (0..4u32)
        .map(|i| {
            let controller = controller.clone();
            thread::spawn(move || {
                controller
                    .add_volume(VolumeId(i), unit_uniform(0.25 * (i + 1) as f32))
                    .expect("queued");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread finished");
    }
    controller.set_volume_interpreter(VolumeInterpreter::IsoSurface).expect("queued");
    controller.set_iso_value(0.6).expect("queued");

    // Nothing is applied until the next frame.
    assert!(renderer.volumes().is_empty());
    assert_eq!(renderer.interpreter(), VolumeInterpreter::Transparent);

    let report = renderer.render_frame(&front_camera(0.5), Viewport::new(2, 2)).expect("frame");
    assert!(report.rebuilt);
    assert_eq!(renderer.volumes().len(), 4);
    assert_eq!(renderer.interpreter(), VolumeInterpreter::IsoSurface);
    assert!((renderer.iso_value() - 0.6).abs() < 1e-6);
    assert_eq!(
        renderer.session().map(|s| s.bound_volumes()),
        Some(vec![VolumeId(0), VolumeId(1), VolumeId(2), VolumeId(3)])
    );

    let status = controller.status();
    assert_eq!(status.volume_count, 4);
    assert_eq!(status.frames_rendered, 1);
    assert!((status.global_max_volume_value - 1.0).abs() < 1e-6);
    assert!((controller.global_max_volume_value() - 1.0).abs() < 1e-6);
}

#[test]
fn test_controller_rejects_invalid_input_locally() {
    let renderer = cpu_renderer(RenderSettings::default());
    let controller = renderer.controller();

    assert!(matches!(
        controller.update_transfer_function(Vec::new()),
        Err(VolumeRenderError::InvalidTransferFunction { .. })
    ));
    assert!(matches!(
        controller.update_transfer_function(vec![
            ControlPoint::new(0.5, Vector4::new(0.0, 0.0, 0.0, 0.0)),
            ControlPoint::new(0.2, Vector4::new(1.0, 1.0, 1.0, 1.0)),
        ]),
        Err(VolumeRenderError::InvalidTransferFunction { .. })
    ));
    assert!(matches!(
        controller.set_render_settings(RenderSettings::default().with_step_size(0.0)),
        Err(VolumeRenderError::InvalidSettings { .. })
    ));
}

#[test]
fn test_rejected_queued_command_is_reported() {
    let mut renderer = renderer_with_volume();
    let controller = renderer.controller();
    renderer.render_frame(&front_camera(0.5), Viewport::new(2, 2)).expect("frame");

    controller.remove_volume(VolumeId(9)).expect("queued");
    controller.set_iso_value(0.4).expect("queued");
    let report = renderer.render_frame(&front_camera(0.5), Viewport::new(2, 2)).expect("frame");

    assert!(!report.rebuilt);
    assert_eq!(renderer.volumes().ids(), vec![VolumeId(0)]);
    assert_eq!(
        controller.status().last_error,
        Some(VolumeRenderError::VolumeNotFound(VolumeId(9)))
    );
    // The rest of the batch still applied.
    assert!((renderer.iso_value() - 0.4).abs() < 1e-6);
}

#[test]
fn test_iso_value_clamps_to_global_range() {
    let mut renderer = renderer_with_volume();
    let controller = renderer.controller();
    controller.set_iso_value(10.0).expect("queued");
    renderer.render_frame(&front_camera(0.5), Viewport::new(1, 1)).expect("frame");
    assert_eq!(renderer.iso_value(), 0.5);

    controller.set_iso_value(-3.0).expect("queued");
    renderer.render_frame(&front_camera(0.5), Viewport::new(1, 1)).expect("frame");
    assert_eq!(renderer.iso_value(), 0.0);
}

#[test]
fn test_transfer_function_updates_do_not_rebuild() {
    let mut renderer = renderer_with_volume();
    let camera = front_camera(0.5);
    let before = renderer.render_frame(&camera, Viewport::new(2, 2)).expect("frame");

    renderer
        .update_transfer_function(vec![
            ControlPoint::new(0.0, Vector4::new(0.0, 0.0, 0.0, 0.0)),
            ControlPoint::new(1.0, Vector4::new(1.0, 0.0, 0.0, 1.0)),
        ])
        .expect("valid table");
    let after = renderer.render_frame(&camera, Viewport::new(2, 2)).expect("frame");
    assert!(!after.rebuilt);
    assert_ne!(before.frame, after.frame);
    let pixel = after.frame.pixel(0, 0).expect("in range");
    assert!(pixel[0] > 0.0 && pixel[1] == 0.0 && pixel[2] == 0.0);

    // An invalid table is rejected and the red one stays active.
    assert!(renderer.update_transfer_function(Vec::new()).is_err());
    let unchanged = renderer.render_frame(&camera, Viewport::new(2, 2)).expect("frame");
    assert_eq!(unchanged.frame, after.frame);
}

#[test]
fn test_settings_change_resizes_table_without_rebuild() {
    let mut renderer = renderer_with_volume();
    let camera = front_camera(0.5);
    renderer.render_frame(&camera, Viewport::new(2, 2)).expect("frame");

    renderer
        .set_settings(RenderSettings::default().with_step_size(0.1).with_table_size(64))
        .expect("valid settings");
    assert_eq!(renderer.transfer_function().tables().size(), 64);
    let report = renderer.render_frame(&camera, Viewport::new(2, 2)).expect("frame");
    assert!(!report.rebuilt);

    assert!(renderer
        .set_settings(RenderSettings::default().with_table_size(1))
        .is_err());
    assert_eq!(renderer.transfer_function().tables().size(), 64);
}

#[test]
fn test_volume_events_reach_subscribers() {
    let mut renderer = cpu_renderer(RenderSettings::default());
    let events = renderer.subscribe_volume_events();
    let seen = Arc::new(AtomicBool::new(false));
    let flag = seen.clone();
    renderer.add_volume_listener(move |event| {
        if event.global_max_volume_value > 0.0 {
            flag.store(true, Ordering::SeqCst);
        }
    });

    renderer.add_volume(VolumeId(3), unit_uniform(0.7)).expect("add");
    let event = events.try_recv().expect("event delivered");
    assert_eq!(event.id, VolumeId(3));
    assert!((event.global_max_volume_value - 0.7).abs() < 1e-6);
    assert!(seen.load(Ordering::SeqCst));
}
