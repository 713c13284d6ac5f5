use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bruecke::marshal::{pack_struct, read_value, unpack_struct, write_value, KeepAlive};
use host::Value;

const RECT_ENC: &str = "{CGRect={CGPoint=dd}{CGSize=dd}}";

fn rect_value() -> Value {
    Value::Object(vec![
        (
            "origin".into(),
            Value::Object(vec![
                ("x".into(), Value::Number(1.0)),
                ("y".into(), Value::Number(2.0)),
            ]),
        ),
        (
            "size".into(),
            Value::Object(vec![
                ("width".into(), Value::Number(3.0)),
                ("height".into(), Value::Number(4.0)),
            ]),
        ),
    ])
}

fn bench_marshal(c: &mut Criterion) {
    c.bench_function("write_read_q", |b| {
        let mut buf = [0u8; 8];
        b.iter(|| {
            let mut keep = KeepAlive::new();
            write_value(
                &mut buf,
                "q",
                black_box(&Value::Number(42.0)),
                &mut keep,
                "bench",
                0,
            )
            .expect("write");
            read_value(&buf, "q").expect("read")
        })
    });

    c.bench_function("rect_pack_unpack", |b| {
        let parsed = encoding::parse_struct(RECT_ENC).expect("parse");
        let value = rect_value();
        let mut buf = vec![0u8; parsed.total_size];
        b.iter(|| {
            let mut keep = KeepAlive::new();
            pack_struct(&mut buf, &parsed, black_box(&value), &mut keep, "bench", 0)
                .expect("pack");
            unpack_struct(&buf, &parsed).expect("unpack")
        })
    });
}

criterion_group!(benches, bench_marshal);
criterion_main!(benches);
