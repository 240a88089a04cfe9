use std::process::ExitCode;

use clap::Parser as ClapParser;

use quill::ast::node::*;
use quill::ast::{BinOp, Node};
use quill::{NativeError, Natives, Program, ScriptHost, VM, VMCreateInfo, Value};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bundled script to run
    #[arg(long, default_value = "add", help = "Script to run (see --list)")]
    demo: String,

    #[arg(long, help = "List the bundled scripts")]
    list: bool,

    #[arg(long, help = "Print the compiled program instead of running it")]
    disassemble: bool,

    #[arg(long, help = "Log every executed instruction")]
    trace: bool,

    #[arg(long, help = "Check every instruction against the stack before running it")]
    validate: bool,

    #[arg(long, help = "Round-trip the program through its binary encoding first")]
    blob: bool,

    #[arg(long, default_value_t = 1_000_000)]
    cycle_limit: u32,
}

const DEMOS: &[(&str, &str, fn() -> Node)] = &[
    ("add", "call a two-argument function", demo_add),
    ("fib", "recursive fibonacci", demo_fib),
    ("loop", "sum an array until a break", demo_loop),
    ("string", "return a guarded string", demo_string),
    ("natives", "call host functions", demo_natives),
];

fn demo_add() -> Node {
    block(vec![
        fun("add", &["a", "b"], vec![ret(binop(BinOp::Add, var("a"), var("b")))]),
        fun(
            "main",
            &[],
            vec![
                let_("sum", call("add", vec![number(3.0), number(4.0)])),
                call("print", vec![var("sum")]),
                ret(var("sum")),
            ],
        ),
    ])
}

fn demo_fib() -> Node {
    let n = || var("n");
    block(vec![
        fun("main", &[], vec![ret(call("fib", vec![number(15.0)]))]),
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
    ])
}

fn demo_loop() -> Node {
    fun(
        "main",
        &[],
        vec![
            let_(
                "xs",
                array((1..=5).map(|i| number(i as f32)).collect()),
            ),
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
            ret(var("total")),
        ],
    )
}

fn demo_string() -> Node {
    fun(
        "main",
        &[],
        vec![
            let_("greeting", string("hello123")),
            if_chain(
                binop(
                    BinOp::Eq,
                    call("len", vec![var("greeting")]),
                    number(8.0),
                ),
                block(vec![ret(var("greeting"))]),
                None,
            ),
            ret(string("too short")),
        ],
    )
}

fn demo_natives() -> Node {
    fun(
        "main",
        &[],
        vec![
            call("log", vec![string("computing a hypotenuse")]),
            ret(call(
                "sqrt",
                vec![binop(
                    BinOp::Add,
                    binop(BinOp::Mul, number(3.0), number(3.0)),
                    binop(BinOp::Mul, number(4.0), number(4.0)),
                )],
            )),
        ],
    )
}

fn natives() -> Natives {
    let mut natives = Natives::new();
    natives.register_function("sqrt", 1, |ctx| Ok(Value::Number(ctx.number(0)?.sqrt())));
    natives.register_action("log", 1, |ctx| {
        let text = ctx.string(0)?;
        println!("[log] {text}");
        Ok(())
    });
    natives.register_function("fail", 0, |_| Err(NativeError::new("asked to fail")));
    natives
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if cli.trace {
        logger.filter_level(log::LevelFilter::Trace);
    }
    logger.init();

    if cli.list {
        for (name, about, _) in DEMOS {
            println!("{name:<10} {about}");
        }
        return ExitCode::SUCCESS;
    }

    let Some((_, _, build)) = DEMOS.iter().find(|(name, _, _)| *name == cli.demo) else {
        eprintln!("unknown demo '{}', try --list", cli.demo);
        return ExitCode::FAILURE;
    };

    let host = ScriptHost::new(natives());
    if let Err(err) = host.reload(&build()) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    let loaded = host.current();

    let decoded;
    let program: &Program = if cli.blob {
        let bytes = match loaded.program.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                eprintln!("blob encode failed: {err}");
                return ExitCode::FAILURE;
            }
        };
        println!("blob: {} bytes", bytes.len());
        decoded = match Program::from_bytes(&bytes) {
            Ok(program) => program,
            Err(err) => {
                eprintln!("blob decode failed: {err}");
                return ExitCode::FAILURE;
            }
        };
        &decoded
    } else {
        &loaded.program
    };

    if cli.disassemble {
        print!("{program}");
        return ExitCode::SUCCESS;
    }

    let mut vm = match VM::new(VMCreateInfo {
        cycle_limit: cli.cycle_limit,
        validate: cli.validate,
        ..VMCreateInfo::default()
    }) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match vm.execute(program, &loaded.env) {
        Ok(value) => {
            println!("=> {}", vm.render(program, value));
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error ({}): {err}", err.sentinel());
            ExitCode::FAILURE
        }
    }
}
