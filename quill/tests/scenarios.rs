use std::sync::Arc;

use parking_lot::Mutex;

use quill::ast::node::*;
use quill::ast::{BinOp, Node, UnOp};
use quill::{
    Compiler, Env, ExecError, NativeError, Natives, OutputBuffer, Program, VM, VMCreateInfo,
    Value, compile,
};

fn program(root: &Node) -> Program {
    match compile(root) {
        Ok(program) => program,
        Err(diag) => panic!("compile failed:\n{diag}"),
    }
}

fn vm_with(info: VMCreateInfo) -> (VM, OutputBuffer) {
    let output = OutputBuffer::new();
    let mut vm = VM::new(info).expect("vm settings");
    vm.set_output(output.clone());
    (vm, output)
}

fn run(root: &Node) -> (Result<Value, ExecError>, String) {
    let program = program(root);
    let (mut vm, output) = vm_with(VMCreateInfo::default());
    let result = vm.execute(&program, &Env::empty());
    (result, output.contents())
}

#[test]
fn one_plus_one() {
    let root = fun(
        "main",
        &[],
        vec![ret(binop(BinOp::Add, number(1.0), number(1.0)))],
    );
    assert_eq!(run(&root).0, Ok(Value::Number(2.0)));
}

#[test]
fn guarded_string_is_returned() {
    let root = fun(
        "main",
        &[],
        vec![
            let_("s", string("hello123")),
            if_chain(
                binop(BinOp::Eq, call("len", vec![var("s")]), number(8.0)),
                block(vec![ret(var("s"))]),
                Some(block(vec![ret(string("nope"))])),
            ),
        ],
    );
    let program = program(&root);
    let (mut vm, _) = vm_with(VMCreateInfo::default());
    let value = vm.execute(&program, &Env::empty()).unwrap();
    assert_eq!(vm.string(&program, value).as_deref(), Some("hello123"));
}

#[test]
fn boolean_operators_evaluate_both_sides() {
    let touched = Arc::new(Mutex::new(0));
    let mut natives = Natives::new();
    let counter = Arc::clone(&touched);
    natives.register_function("touch", 0, move |_| {
        *counter.lock() += 1;
        Ok(Value::Bool(true))
    });

    let mut compiler = Compiler::new();
    compiler.declare_native("touch", 0).unwrap();
    let program = compiler
        .compile(&fun(
            "main",
            &[],
            vec![
                let_("a", binop(BinOp::And, boolean(false), call("touch", vec![]))),
                let_("b", binop(BinOp::Or, boolean(true), call("touch", vec![]))),
                let_("c", unop(UnOp::Not, binop(BinOp::And, var("a"), var("b")))),
                ret(binop(
                    BinOp::And,
                    var("c"),
                    binop(BinOp::NotEq, var("a"), var("b")),
                )),
            ],
        ))
        .unwrap();
    let env = Env::bind(&program, &natives).unwrap();

    let (mut vm, _) = vm_with(VMCreateInfo::default());
    assert_eq!(vm.execute(&program, &env), Ok(Value::Bool(true)));
    assert_eq!(*touched.lock(), 2, "no short circuit");
}

#[test]
fn host_calls_exported_function() {
    let root = block(vec![fun(
        "add",
        &["a", "b"],
        vec![ret(binop(BinOp::Add, var("a"), var("b")))],
    )]);
    let program = program(&root);
    let (mut vm, _) = vm_with(VMCreateInfo::default());
    let sum = vm.call(
        &program,
        &Env::empty(),
        "add",
        &[Value::Number(3.0), Value::Number(4.0)],
    );
    assert_eq!(sum, Ok(Value::Number(7.0)));
    assert!(matches!(
        vm.call(&program, &Env::empty(), "add", &[Value::Number(3.0)]),
        Err(ExecError::Call(_))
    ));
}

#[test]
fn collection_reclaims_unreachable_blocks() {
    let (mut vm, _) = vm_with(VMCreateInfo::default());
    let first = vm.allocate(70).unwrap();
    vm.allocate(70).unwrap();
    let used = vm.heap().used();
    assert_eq!(used, 140);

    vm.collect();
    assert_eq!(vm.heap().used(), 0);

    let third = vm.allocate(70).unwrap();
    assert!(vm.heap().used() <= used, "heap usage must not grow");
    assert_eq!(third.address, first.address, "freed block is reused");
}

#[test]
fn script_allocation_triggers_collection() {
    let seventy: Vec<Node> = (0..70).map(|i| number(i as f32)).collect();
    let root = fun(
        "main",
        &[],
        vec![
            let_("last", number(0.0)),
            for_each(
                "c",
                string("abcdefghijklmnopqrst"),
                block(vec![
                    let_("block", array(seventy)),
                    assign(var("last"), call("len", vec![var("block")])),
                ]),
            ),
            ret(var("last")),
        ],
    );
    let program = program(&root);
    // 256 heap slots hold three 70-slot blocks at most
    let (mut vm, _) = vm_with(VMCreateInfo {
        memory_size: 512,
        ..VMCreateInfo::default()
    });
    assert_eq!(vm.execute(&program, &Env::empty()), Ok(Value::Number(70.0)));
    assert!(vm.heap().collections() > 0);
}

#[test]
fn recursion_keeps_frames_apart() {
    let n = || var("n");
    let root = block(vec![
        fun(
            "fact",
            &["n"],
            vec![
                let_("m", n()),
                if_chain(
                    binop(BinOp::Less, n(), number(2.0)),
                    block(vec![ret(number(1.0))]),
                    None,
                ),
                let_("r", call("fact", vec![binop(BinOp::Sub, n(), number(1.0))])),
                ret(binop(BinOp::Mul, var("m"), var("r"))),
            ],
        ),
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
    ]);
    let program = program(&root);
    let (mut vm, _) = vm_with(VMCreateInfo::default());
    let env = Env::empty();
    assert_eq!(
        vm.call(&program, &env, "fact", &[Value::Number(6.0)]),
        Ok(Value::Number(720.0))
    );
    assert_eq!(
        vm.call(&program, &env, "fib", &[Value::Number(10.0)]),
        Ok(Value::Number(55.0))
    );
    assert_eq!(vm.stack().depth(), 0, "host return empties the stack");
}

#[test]
fn address_operands_land_on_instructions() {
    let root = block(vec![
        fun(
            "main",
            &[],
            vec![
                let_("xs", array(vec![number(1.0), number(2.0)])),
                for_each(
                    "x",
                    var("xs"),
                    block(vec![if_chain(
                        binop(BinOp::Eq, var("x"), number(2.0)),
                        block(vec![brk()]),
                        Some(if_chain(
                            boolean(false),
                            block(vec![call("print", vec![var("x")])]),
                            Some(block(vec![call("later", vec![])])),
                        )),
                    )]),
                ),
                ret(call("later", vec![])),
            ],
        ),
        fun("later", &[], vec![ret(number(1.0))]),
    ]);
    let program = program(&root);
    let mut checked = 0;
    for ins in program.instructions() {
        let ins = ins.unwrap();
        if ins.op.has_address_operand() {
            assert!(
                program.is_instruction_boundary(ins.operands[0]),
                "{ins} at #{} targets the middle of an instruction",
                ins.offset
            );
            checked += 1;
        }
    }
    assert!(checked >= 8, "only {checked} address operands found");
}

#[test]
fn loop_break_and_print() {
    let root = fun(
        "main",
        &[],
        vec![
            let_("xs", array((1..=5).map(|i| number(i as f32)).collect())),
            let_("total", number(0.0)),
            for_each(
                "x",
                var("xs"),
                block(vec![
                    if_chain(
                        binop(BinOp::Greater, var("x"), number(3.0)),
                        block(vec![brk()]),
                        None,
                    ),
                    assign(var("total"), binop(BinOp::Add, var("total"), var("x"))),
                ]),
            ),
            call("print", vec![var("xs")]),
            call("print", vec![string("done")]),
            ret(var("total")),
        ],
    );
    let (result, output) = run(&root);
    assert_eq!(result, Ok(Value::Number(6.0)));
    assert_eq!(output, "[ 1 2 3 4 5 ]\ndone\n");
}

#[test]
fn sibling_loops_reuse_their_variable() {
    let root = fun(
        "main",
        &[],
        vec![
            let_("sum", number(0.0)),
            for_each(
                "x",
                array(vec![number(1.0), number(2.0)]),
                block(vec![assign(var("sum"), binop(BinOp::Add, var("sum"), var("x")))]),
            ),
            for_each(
                "x",
                array(vec![number(3.0)]),
                block(vec![assign(var("sum"), binop(BinOp::Add, var("sum"), var("x")))]),
            ),
            ret(var("sum")),
        ],
    );
    assert_eq!(run(&root).0, Ok(Value::Number(6.0)));
}

#[test]
fn branches_may_declare_the_same_local() {
    let root = fun(
        "main",
        &[],
        vec![
            if_chain(
                boolean(false),
                block(vec![let_("y", number(1.0))]),
                Some(block(vec![let_("y", number(2.0))])),
            ),
            ret(var("y")),
        ],
    );
    assert_eq!(run(&root).0, Ok(Value::Number(2.0)));
}

#[test]
fn unused_results_inside_loops_are_dropped() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut natives = Natives::new();
    natives.register_function("square", 1, move |ctx| {
        let x = ctx.number(0)?;
        sink.lock().push(x);
        Ok(Value::Number(x * x))
    });

    let mut compiler = Compiler::new();
    for native in natives.iter() {
        compiler.offer_native(&native.name, native.arity, native.kind).unwrap();
    }
    let root = fun(
        "main",
        &[],
        vec![
            let_("xs", array(vec![number(1.0), number(2.0), number(3.0)])),
            let_("count", number(0.0)),
            for_each(
                "x",
                var("xs"),
                block(vec![
                    call("square", vec![var("x")]),
                    call("len", vec![var("xs")]),
                    assign(var("count"), binop(BinOp::Add, var("count"), number(1.0))),
                ]),
            ),
            ret(var("count")),
        ],
    );
    let program = compiler.compile(&root).unwrap();
    let env = Env::bind(&program, &natives).unwrap();
    let (mut vm, _) = vm_with(VMCreateInfo::default());

    assert_eq!(vm.execute(&program, &env), Ok(Value::Number(3.0)));
    assert_eq!(*seen.lock(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn natives_receive_arguments_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let mut natives = Natives::new();
    natives.register_function("sub", 2, |ctx| Ok(Value::Number(ctx.number(0)? - ctx.number(1)?)));
    natives.register_action("note", 1, move |ctx| {
        sink.lock().push(ctx.string(0)?);
        Ok(())
    });
    natives.register_function("boom", 0, |_| Err(NativeError::new("kaput")));

    let root = block(vec![
        native("sub", &["a", "b"]),
        native("note", &["text"]),
        native("boom", &[]),
        fun(
            "main",
            &[],
            vec![
                call("note", vec![string("start")]),
                ret(call("sub", vec![number(10.0), number(4.0)])),
            ],
        ),
        fun("explode", &[], vec![ret(call("boom", vec![]))]),
    ]);
    let program = program(&root);
    let env = Env::bind(&program, &natives).unwrap();
    let (mut vm, _) = vm_with(VMCreateInfo::default());

    assert_eq!(vm.execute(&program, &env), Ok(Value::Number(6.0)));
    assert_eq!(*log.lock(), vec!["start".to_owned()]);

    let err = vm.call(&program, &env, "explode", &[]).unwrap_err();
    assert_eq!(
        err,
        ExecError::Native {
            name: "boom".to_owned(),
            message: "kaput".to_owned()
        }
    );
}

#[test]
fn missing_native_fails_binding() {
    let root = block(vec![
        native("nowhere", &[]),
        fun("main", &[], vec![ret(call("nowhere", vec![]))]),
    ]);
    let program = program(&root);
    let err = Env::bind(&program, &Natives::new()).unwrap_err();
    assert_eq!(err.problems.len(), 1);

    let (mut vm, _) = vm_with(VMCreateInfo::default());
    assert_eq!(
        vm.execute(&program, &Env::empty()),
        Err(ExecError::EnvNotReady)
    );
}

#[test]
fn runaway_recursion_overflows_the_stack() {
    let root = fun("main", &[], vec![ret(call("main", vec![]))]);
    assert_eq!(run(&root).0, Err(ExecError::StackOverflow));
}

#[test]
fn blob_round_trip_runs_the_same() {
    let root = block(vec![
        fun("square", &["x"], vec![ret(binop(BinOp::Mul, var("x"), var("x")))]),
        fun(
            "main",
            &[],
            vec![ret(call("square", vec![number(9.0)]))],
        ),
    ]);
    let original = program(&root);
    let decoded = Program::from_bytes(&original.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, original);

    let (mut vm, _) = vm_with(VMCreateInfo::default());
    assert_eq!(vm.execute(&decoded, &Env::empty()), Ok(Value::Number(81.0)));
}

#[cfg(feature = "validation")]
mod validation {
    use super::*;
    use quill::{CodeBuilder, Op, ViolationKind};

    #[test]
    fn compiled_code_passes_validation() {
        let root = fun(
            "main",
            &[],
            vec![
                let_("xs", array(vec![number(2.0), number(3.0)])),
                let_("p", number(1.0)),
                for_each(
                    "x",
                    var("xs"),
                    block(vec![assign(var("p"), binop(BinOp::Mul, var("p"), var("x")))]),
                ),
                ret(var("p")),
            ],
        );
        let program = program(&root);
        let (mut vm, _) = vm_with(VMCreateInfo {
            validate: true,
            ..VMCreateInfo::default()
        });
        assert!(vm.validates());
        assert_eq!(vm.execute(&program, &Env::empty()), Ok(Value::Number(6.0)));
    }

    #[test]
    fn bad_call_target_is_caught() {
        let mut builder = CodeBuilder::new();
        builder.emit(Op::Call, [1, 0]).unwrap();
        builder.emit(Op::Halt, [0, 0]).unwrap();
        let program = Program {
            code: builder.link().unwrap().code,
            ..Program::default()
        };
        let (mut vm, _) = vm_with(VMCreateInfo {
            validate: true,
            ..VMCreateInfo::default()
        });
        let err = vm.execute(&program, &Env::empty()).unwrap_err();
        assert_eq!(err.sentinel(), -9999);
        match err {
            ExecError::Validation(v) => {
                assert_eq!(v.kind, ViolationKind::CallTargetNotFrame(5));
            }
            other => panic!("expected a validation error, got {other}"),
        }
    }
}
