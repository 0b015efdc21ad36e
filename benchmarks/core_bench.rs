use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use minnow_core::channel::{encode_message, FrameDecoder};
use minnow_core::{ChannelMessage, StackFrame, TelemetryConfig, TelemetryParser, Variable};

fn repl_stream() -> Vec<u8> {
    let mut bytes = Vec::new();
    for i in 0..200 {
        bytes.extend_from_slice(format!("loop {i}: reading sensor\r\n").as_bytes());
        bytes.extend_from_slice(format!("({}, {:.2}, -{})\r\n", i, f64::from(i) * 0.25, i % 7).as_bytes());
    }
    bytes
}

fn bench_telemetry_parser(c: &mut Criterion) {
    let stream = repl_stream();
    let mut group = c.benchmark_group("telemetry");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("parse_mixed_output", |b| {
        b.iter(|| {
            let mut parser = TelemetryParser::new(&TelemetryConfig::default());
            for chunk in stream.chunks(64) {
                black_box(parser.feed(black_box(chunk)));
            }
        })
    });
    group.finish();
}

fn bench_frame_decoder(c: &mut Criterion) {
    let stopped = ChannelMessage::Stopped {
        file: "main.mw".to_string(),
        line: 12,
        reason: minnow_core::channel::StopReason::Step,
        frames: vec![
            StackFrame {
                file: "main.mw".to_string(),
                line: 12,
                function: "blink".to_string(),
                variables: vec![Variable::new("count", "int", "3")],
            },
            StackFrame { file: "main.mw".to_string(), line: 20, function: "<module>".to_string(), variables: Vec::new() },
        ],
    };
    let frame = encode_message(&stopped).unwrap_or_default();
    let stream: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * 100).collect();

    let mut group = c.benchmark_group("channel");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("decode_stopped_frames", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new(1024 * 1024);
            for chunk in stream.chunks(500) {
                decoder.feed(chunk);
                while let Ok(Some(payload)) = decoder.next_frame() {
                    black_box(ChannelMessage::decode(&payload).ok());
                }
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_telemetry_parser, bench_frame_decoder);
criterion_main!(benches);
