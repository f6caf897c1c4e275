use criterion::{Criterion, criterion_group, criterion_main};
use lab_stager::coercion::coerce_value;
use lab_stager::header::parse_header_lines;
use lab_stager::schema::FieldType;
use std::hint::black_box;

const HEADER: &str = "\
#Procedure: <laser_setup.procedures.IVg.IVg>
#Parameters:
#\tChip group name: Alisson
#\tChip number: 67
#\tVDS: 0.1 V
#\tLaser wavelength: 455.0 nm
#\tLaser voltage: 3.5
#\tStep time: 0.25
#Metadata:
#\tStart time: 1715509800
#\tSensor: Keithley 2450
#Data:
Vg (V),I (A)
";

fn bench_parse_header(c: &mut Criterion) {
    c.bench_function("parse_header_lines", |b| {
        b.iter(|| parse_header_lines(black_box(HEADER.lines()), black_box("IVg_001.csv")))
    });
}

fn bench_coerce_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("coerce_value");
    group.bench_function("sniffed_float", |b| {
        b.iter(|| coerce_value(black_box("455.0"), None))
    });
    group.bench_function("sniffed_text", |b| {
        b.iter(|| coerce_value(black_box("0.1 V"), None))
    });
    group.bench_function("declared_datetime", |b| {
        b.iter(|| coerce_value(black_box("2024-05-12T10:30:00Z"), Some(FieldType::Datetime)))
    });
    group.finish();
}

criterion_group!(benches, bench_parse_header, bench_coerce_value);
criterion_main!(benches);
