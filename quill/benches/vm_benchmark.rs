//! Run with validation compiled in (default):
//!   cargo bench --bench vm_benchmark
//!
//! Run without the validation layer:
//!   cargo bench --bench vm_benchmark --no-default-features

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use quill::ast::node::*;
use quill::ast::{BinOp, Node};
use quill::{Env, OutputBuffer, Program, VM, VMCreateInfo, Value, compile};

fn build(root: &Node) -> Program {
    compile(root).expect("benchmark script compiles")
}

fn create_vm(validate: bool) -> VM {
    let mut vm = VM::new(VMCreateInfo {
        memory_size: 8192,
        cycle_limit: u32::MAX,
        validate,
    })
    .expect("vm settings");
    vm.set_output(OutputBuffer::new());
    vm
}

fn fib_script() -> Node {
    let n = || var("n");
    block(vec![
        fun(
            "fib",
            &["n"],
            vec![
                if_chain(
                    binop(BinOp::Less, n(), number(2.0)),
                    block(vec![ret(n())]),
                    None,
                ),
                ret(binop(
                    BinOp::Add,
                    call("fib", vec![binop(BinOp::Sub, n(), number(1.0))]),
                    call("fib", vec![binop(BinOp::Sub, n(), number(2.0))]),
                )),
            ],
        ),
        fun("main", &[], vec![ret(call("fib", vec![number(15.0)]))]),
    ])
}

/// Allocates a fresh 100-element array per iteration, so the collector
/// runs repeatedly.
fn churn_script() -> Node {
    let hundred: Vec<Node> = (0..100).map(|i| number(i as f32)).collect();
    let items: Vec<Node> = (0..50).map(|i| number(i as f32)).collect();
    fun(
        "main",
        &[],
        vec![
            let_("total", number(0.0)),
            let_("outer", array(items)),
            for_each(
                "i",
                var("outer"),
                block(vec![
                    let_("chunk", array(hundred)),
                    assign(
                        var("total"),
                        binop(BinOp::Add, var("total"), call("len", vec![var("chunk")])),
                    ),
                ]),
            ),
            ret(var("total")),
        ],
    )
}

/// Benchmark 1: recursive calls, frame setup and teardown.
fn bench_fibonacci(c: &mut Criterion) {
    let program = build(&fib_script());
    let env = Env::empty();
    let mut vm = create_vm(false);
    assert_eq!(vm.execute(&program, &env), Ok(Value::Number(610.0)));

    c.bench_function("fibonacci_15", |b| {
        b.iter(|| vm.execute(black_box(&program), &env).expect("fib runs"));
    });
}

/// Benchmark 2: the same with per-instruction validation enabled.
fn bench_fibonacci_validated(c: &mut Criterion) {
    let program = build(&fib_script());
    let env = Env::empty();
    let mut vm = create_vm(true);

    c.bench_function("fibonacci_15_validated", |b| {
        b.iter(|| vm.execute(black_box(&program), &env).expect("fib runs"));
    });
}

/// Benchmark 3: heap allocation and collection.
fn bench_allocation_churn(c: &mut Criterion) {
    let program = build(&churn_script());
    let env = Env::empty();
    let mut vm = create_vm(false);
    assert_eq!(vm.execute(&program, &env), Ok(Value::Number(5000.0)));

    c.bench_function("allocation_churn_50x100", |b| {
        b.iter(|| vm.execute(black_box(&program), &env).expect("churn runs"));
    });
}

/// Benchmark 4: code generation and linking.
fn bench_compile(c: &mut Criterion) {
    let script = fib_script();
    c.bench_function("compile_fib", |b| {
        b.iter(|| compile(black_box(&script)).expect("compiles"));
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_fibonacci, bench_fibonacci_validated, bench_allocation_churn, bench_compile
}

criterion_main!(benches);
