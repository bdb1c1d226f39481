//! Snapshot Benchmarks
//!
//! Measures write and read throughput for heaps of growing size.
//!
//! Run with: `cargo bench -p xsnap-snapshot`

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use xsnap_core::{Creation, Machine, Value};
use xsnap_snapshot::{SnapshotOptions, read_snapshot, write_snapshot};

/// A machine with `n` small objects reachable from the global object
fn populated(n: usize) -> Machine {
    let mut machine = Machine::new(Creation::small()).expect("machine");
    let global = machine.global().expect("global");
    let list = machine.new_array(&[]).expect("array");
    let value = machine.intern("value").expect("key");
    for i in 0..n {
        let object = machine.new_plain_object().expect("object");
        machine
            .set(object, value, Value::Integer(i as i32))
            .expect("set");
        machine
            .push_item(list, Value::Reference(object))
            .expect("push");
    }
    let key = machine.intern("objects").expect("key");
    machine
        .set(global, key, Value::Reference(list))
        .expect("set");
    machine
}

fn snapshot_benchmark(c: &mut Criterion) {
    let options = SnapshotOptions::default();
    let mut group = c.benchmark_group("snapshot");

    for n in [100usize, 1000, 10000] {
        let machine = populated(n);
        let mut bytes = Vec::new();
        write_snapshot(&machine, &mut bytes, &options).expect("write");
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("write", n), &machine, |b, machine| {
            b.iter(|| {
                let mut out = Vec::with_capacity(bytes.len());
                write_snapshot(black_box(machine), &mut out, &options).expect("write");
                out
            })
        });
        group.bench_with_input(BenchmarkId::new("read", n), &bytes, |b, bytes| {
            b.iter(|| read_snapshot(&mut black_box(bytes.as_slice()), &options).expect("read"))
        });
    }

    group.finish();
}

criterion_group!(benches, snapshot_benchmark);
criterion_main!(benches);
