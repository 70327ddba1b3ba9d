//! Propagation benchmarks.
//!
//! Run with: cargo bench --package dicebox-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dicebox_core::dice::{add_die_roll, dice_atom, reroll_die, total};
use dicebox_core::{Atom, Effect, Selector, Store};

/// A chain of selectors, each adding one to the previous.
fn chain(root: &Atom<u64>, length: usize) -> Selector<u64> {
    let mut last = {
        let root = root.clone();
        Selector::new(move |peek, _| Ok(*peek.get(&root)? + 1))
    };
    for _ in 1..length {
        let previous = last.clone();
        last = Selector::new(move |peek, _| Ok(*peek.get(&previous)? + 1));
    }
    last
}

fn bench_live_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("live_chain_dispatch");
    for length in [10, 100, 500] {
        let store = Store::new();
        let root = Atom::new(0_u64);
        let sink = chain(&root, length);
        let effect = Effect::new(move |peek, _| {
            black_box(peek.get(&sink)?);
            Ok(())
        });
        let _subscription = store.subscribe(&effect).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            let mut n = 0;
            b.iter(|| {
                n += 1;
                store.dispatch(root.set(n)).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_cold_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_chain_peek");
    for length in [10, 100] {
        let store = Store::new();
        let root = Atom::new(0_u64);
        let sink = chain(&root, length);

        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            b.iter(|| black_box(*store.peek(&sink).unwrap()))
        });
    }
    group.finish();
}

fn bench_dice_reroll(c: &mut Criterion) {
    let store = Store::new();
    store
        .dispatch((0..50).map(|_| add_die_roll(6)).collect::<Vec<_>>())
        .unwrap();
    let effect = Effect::new(|peek, _| {
        black_box(peek.get(&total())?);
        Ok(())
    });
    let _subscription = store.subscribe(&effect).unwrap();
    let dice = store.peek(dice_atom()).unwrap();

    c.bench_function("reroll_one_of_50_dice", |b| {
        b.iter(|| store.dispatch(reroll_die(&dice[0])).unwrap())
    });
}

criterion_group!(benches, bench_live_chain, bench_cold_chain, bench_dice_reroll);
criterion_main!(benches);
