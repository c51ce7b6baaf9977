// ABOUTME: Benchmark suite for wire message encoding and decoding
// ABOUTME: Measures JSON header serialization and the framed-header parse path

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use renderfarm::protocol::{
    FrameHeader, FrameSet, RenderRequest, Request, Upstream,
};
use std::time::Duration;

fn sample_render_request() -> Request {
    Request::Render(RenderRequest {
        session: "benchmarkscene".to_string(),
        frames: FrameSet::Many((1..=250).collect()),
        render_format: Some("OPEN_EXR".to_string()),
    })
}

fn sample_frame_header() -> Upstream {
    Upstream::Frame(FrameHeader {
        frame_size: 2_457_600,
        frame_number: 128,
        file_extension: "png".to_string(),
    })
}

fn framed(message: &impl serde::Serialize) -> Vec<u8> {
    let header = serde_json::to_vec(message).unwrap();
    let mut bytes = (header.len() as u64).to_be_bytes().to_vec();
    bytes.extend_from_slice(&header);
    bytes
}

fn bench_encode(c: &mut Criterion) {
    let render = sample_render_request();
    let frame = sample_frame_header();

    let mut group = c.benchmark_group("encode");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("render_request", |b| {
        b.iter(|| serde_json::to_vec(black_box(&render)).unwrap())
    });
    group.bench_function("frame_header", |b| {
        b.iter(|| serde_json::to_vec(black_box(&frame)).unwrap())
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let render_bytes = serde_json::to_vec(&sample_render_request()).unwrap();
    let frame_bytes = serde_json::to_vec(&sample_frame_header()).unwrap();

    let mut group = c.benchmark_group("decode");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("render_request", |b| {
        b.iter(|| serde_json::from_slice::<Request>(black_box(&render_bytes)).unwrap())
    });
    group.bench_function("frame_header", |b| {
        b.iter(|| serde_json::from_slice::<Upstream>(black_box(&frame_bytes)).unwrap())
    });

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let framed_request = framed(&sample_render_request());

    let mut group = c.benchmark_group("framing");

    group.bench_function("prefix_and_parse", |b| {
        b.iter(|| {
            let bytes = black_box(&framed_request);
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&bytes[..8]);
            let len = u64::from_be_bytes(prefix) as usize;
            serde_json::from_slice::<Request>(&bytes[8..8 + len]).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_framing);
criterion_main!(benches);
