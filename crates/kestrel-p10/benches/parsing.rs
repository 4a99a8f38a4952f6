use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kestrel_p10::{Frame, OriginMode};

fn bench_parse(c: &mut Criterion) {
    let plain = "ABAAB P #room :The quick brown fox jumps over the lazy dog";
    let tagged = "@time=2026-01-01T00:00:00.000Z;msgid=AB-1700000000-42;+typing=active \
                  ABAAB P #room :The quick brown fox jumps over the lazy dog";
    let burst = "AB B #room 1700000000 +ntk sekrit ABAAB:o,ABAAC,ABAAD:v :%*!*@spam.example";

    c.bench_function("parse_plain", |b| {
        b.iter(|| Frame::parse(black_box(plain), OriginMode::Server).unwrap())
    });
    c.bench_function("parse_tagged", |b| {
        b.iter(|| Frame::parse(black_box(tagged), OriginMode::Server).unwrap())
    });
    c.bench_function("parse_burst", |b| {
        b.iter(|| Frame::parse(black_box(burst), OriginMode::Server).unwrap())
    });
    c.bench_function("serialize", |b| {
        let frame = Frame::parse(tagged, OriginMode::Server).unwrap();
        b.iter(|| black_box(&frame).serialize().unwrap())
    });
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
