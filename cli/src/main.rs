use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use common::{ACC_PUBLIC, ACC_STATIC};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use vm::Vm;
use vm::constant_pool::{ConstantPool, CpEntry};
use vm::error::AbortOnThrow;
use vm::method::{MethodEntry, MethodTable};
use vm::object::{FieldKind, FieldTag};
use vm::opcode as op;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// arguments handed to the sample program's main(String[])
    args: Vec<String>,
}

/// Assembles the built-in sample: main(String[]) counts its arguments and
/// sums 1..=n into the static field Demo.sum.
fn sample_program() -> Result<MethodTable> {
    let cp = ConstantPool::new(vec![CpEntry::FieldRef {
        class: "Demo".to_string(),
        name: "sum".to_string(),
        descriptor: "I".to_string(),
        is_static: true,
    }]);

    let code = vec![
        op::ALOAD_0,
        op::ARRAYLENGTH, // n = args.length
        op::ISTORE_1,
        op::ICONST_0, // sum = 0
        op::ISTORE_2,
        op::ICONST_1, // i = 1
        op::ISTORE_3,
        op::ILOAD_3, // loop: while i <= n
        op::ILOAD_1,
        op::IF_ICMPGT,
        0,
        13,
        op::ILOAD_2, // sum += i
        op::ILOAD_3,
        op::IADD,
        op::ISTORE_2,
        op::IINC, // i += 1
        3,
        1,
        op::GOTO,
        0xff,
        0xf4,
        op::ILOAD_2,
        op::PUTSTATIC,
        0,
        1,
        op::RETURN,
    ];

    let table = MethodTable::default();
    table.register(MethodEntry {
        class_name: "Demo".to_string(),
        name: "main".to_string(),
        descriptor: "([Ljava/lang/String;)V".to_string(),
        access_flags: ACC_PUBLIC | ACC_STATIC,
        max_stack: 2,
        max_locals: 4,
        code: Arc::new(code),
        constant_pool: Arc::new(cp),
    })?;
    Ok(table)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let table = sample_program()?;
    let vm = Vm::new(Arc::new(table), Arc::new(AbortOnThrow));
    let outcome = vm.run_main("Demo", &args.args)?;

    let tag = FieldTag {
        kind: FieldKind::Int,
        is_static: true,
    };
    let sum = vm.statics().get("Demo", "sum", tag)?;
    info!("Demo.sum = {sum:?} for {} argument(s)", args.args.len());

    std::process::exit(outcome.exit_code());
}
