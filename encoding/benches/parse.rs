use criterion::{black_box, criterion_group, criterion_main, Criterion};

use encoding::{method_argument, parse_struct, split_first};

const CGRECT: &str = "{CGRect={CGPoint=dd}{CGSize=dd}}";
const METHOD: &str = "v40@0:8@16@?<v@?q>24";

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_struct_cached", |b| {
        b.iter(|| parse_struct(black_box(CGRECT)).expect("parse"))
    });

    c.bench_function("split_first_nested", |b| {
        b.iter(|| split_first(black_box(CGRECT)).expect("split"))
    });

    c.bench_function("method_argument_block_tail", |b| {
        b.iter(|| method_argument(black_box(METHOD), 3).expect("walk"))
    });
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
