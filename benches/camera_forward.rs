use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use litholens::camera::CameraPipeline;
use litholens::compose::tensor_from_vec;
use litholens::config::{DoeConfig, DoeLayout, LossType, OpticsConfig, RunConfig};
use litholens::doe::Doe;
use litholens::litho::LithoModel;
use litholens::objective::Evaluator;
use litholens::optics::FreeSpace;
use litholens::CoDesignBackend as B;

fn bench_camera(c: &mut Criterion) {
    let mut group = c.benchmark_group("camera_forward");
    group.sample_size(20);
    let device = Default::default();

    for &n in &[32usize, 64] {
        let optics = OpticsConfig {
            input_shape: n,
            output_shape: n,
            ..OpticsConfig::default()
        };
        let doe_cfg = DoeConfig {
            num_partition: n / 4,
            layout: DoeLayout::Rotational,
            ..DoeConfig::default()
        };
        let doe = Doe::<B>::new(&doe_cfg, n, &device).unwrap();
        let logits = doe.init_logits(&mut ChaCha8Rng::seed_from_u64(1), &device);
        let fs = FreeSpace::<B>::new(&optics, 70e-9, &device).unwrap();
        let mut camera = CameraPipeline::new(doe, fs, false, 7);
        let target = tensor_from_vec::<B, 4>(vec![0.5; n * n], [1, 1, n, n], &device);

        group.bench_with_input(BenchmarkId::new("render", format!("n{n}")), &n, |b, _| {
            b.iter(|| {
                camera
                    .render(&logits, target.clone(), &LithoModel::Ideal)
                    .unwrap()
            })
        });

        for loss_type in [LossType::Cbr, LossType::DeconvLoss] {
            let run = RunConfig {
                loss_type,
                ..RunConfig::default()
            };
            let evaluator = Evaluator::<B>::from_config(&run, &device).unwrap();
            group.bench_with_input(
                BenchmarkId::new(
                    format!("render_eval_backward_{}", loss_type.as_str()),
                    format!("n{n}"),
                ),
                &n,
                |b, _| {
                    b.iter(|| {
                        let cap = camera
                            .render(&logits, target.clone(), &LithoModel::Ideal)
                            .unwrap();
                        let eval = evaluator
                            .evaluate(cap.sensor_image, target.clone(), cap.psf)
                            .unwrap();
                        eval.loss.backward()
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_camera);
criterion_main!(benches);
