use std::collections::BTreeMap;

use mxc::{
    frontend::{
        ast::{
            BinaryOperator, CompareOperator, Expression, FunctionDeclaration, GlobalDeclaration,
            Program, Statement, Variable,
        },
        parse_program,
    },
    middle::lir::{Function, Instruction, Operand, Storage, interpreter::run_module},
    pipeline::{CompileOptions, Stage, compile, lower},
};

fn function(name: &str, parameters: &[&str], body: Vec<Statement>) -> FunctionDeclaration {
    FunctionDeclaration {
        name: name.to_owned(),
        parameters: parameters.iter().map(|p| p.to_string()).collect(),
        returns_value: true,
        body,
    }
}

fn stop_after(stage: Stage) -> CompileOptions {
    CompileOptions {
        stop_after: stage,
        ..CompileOptions::default()
    }
}

fn count(function: &Function, predicate: impl Fn(&Instruction) -> bool) -> usize {
    function
        .all_instructions()
        .into_iter()
        .filter(|id| predicate(function.instruction(*id)))
        .count()
}

fn register_copies(function: &Function, block_name: &str) -> usize {
    let block = function
        .live_blocks()
        .into_iter()
        .find(|b| function.block(*b).name.value() == block_name)
        .unwrap();

    function
        .instructions_in(block)
        .filter(|(_, i)| {
            matches!(
                i,
                Instruction::Move {
                    destination: Storage::Virtual(_),
                    source: Operand::Storage(Storage::Virtual(_)),
                }
            )
        })
        .count()
}

/// `v = 0; if (p < 5) v = 1; return v;`
fn if_without_else() -> Program {
    let v = Variable::local("v", 0);

    Program {
        globals: Vec::new(),
        functions: vec![function(
            "pick",
            &["p"],
            vec![
                Statement::Declare {
                    variable: v.clone(),
                    initializer: Some(Expression::Integer(0)),
                },
                Statement::If {
                    condition: Expression::compare(
                        CompareOperator::Less,
                        Expression::Variable(Variable::parameter("p", 0)),
                        Expression::Integer(5),
                    ),
                    then_branch: vec![Statement::assign(v.clone(), Expression::Integer(1))],
                    else_branch: Vec::new(),
                },
                Statement::Return(Some(Expression::Variable(v))),
            ],
        )],
    }
}

#[test]
fn if_without_else_needs_one_phi_and_one_copy() {
    let program = if_without_else();

    let ssa = lower(&program, &stop_after(Stage::Ssa)).unwrap();
    let pick = &ssa.functions.raw[0];

    assert_eq!(count(pick, |i| matches!(i, Instruction::Branch { .. })), 1);
    assert_eq!(count(pick, Instruction::is_phi), 1);

    let ir = lower(&program, &stop_after(Stage::Ir)).unwrap();
    let pick = &ir.functions.raw[0];

    assert_eq!(count(pick, Instruction::is_phi), 0);
    assert_eq!(register_copies(pick, "if_then"), 1);
    assert_eq!(register_copies(pick, "pick_entry"), 0);
}

#[test]
fn unreferenced_globals_still_get_storage() {
    let program = Program {
        globals: vec![
            GlobalDeclaration {
                name: "a".to_owned(),
                initializer: None,
            },
            GlobalDeclaration {
                name: "b".to_owned(),
                initializer: None,
            },
        ],
        functions: vec![function(
            "main",
            &[],
            vec![Statement::Return(Some(Expression::Integer(0)))],
        )],
    };

    let asm = compile(&program, &BTreeMap::new(), &CompileOptions::default()).unwrap();

    assert_eq!(asm.matches(": dq 0").count(), 2);
    assert!(asm.contains("global __init_entry_1\nglobal a_1\nglobal b_1\n"));
    assert!(asm.contains("a_1: dq 0\nb_1: dq 0\n"));
    assert!(!asm.contains(".DATA_cstring"));
}

#[test]
fn eight_arguments_need_two_stack_words() {
    let program = Program {
        globals: Vec::new(),
        functions: vec![
            function(
                "sum",
                &["a", "b", "c", "d", "e", "f", "g", "h"],
                vec![Statement::Return(Some(Expression::binary(
                    BinaryOperator::Add,
                    Expression::Variable(Variable::parameter("a", 0)),
                    Expression::Variable(Variable::parameter("h", 7)),
                )))],
            ),
            function(
                "main",
                &[],
                vec![Statement::Return(Some(Expression::call(
                    "sum",
                    (0..8).map(Expression::Integer).collect(),
                )))],
            ),
        ],
    };

    let asm = compile(&program, &BTreeMap::new(), &CompileOptions::default()).unwrap();

    assert_eq!(asm.matches("sub     rsp, ").count(), 1);
    assert!(asm.contains("sub     rsp, 16\n"));
    assert!(asm.contains("mov     qword [rsp], 6\n"));
    assert!(asm.contains("mov     qword [rsp+8], 7\n"));
    assert!(asm.contains("qword [rbp+24]"));
    assert!(asm.contains("call    sum_entry_1\n"));
}

#[test]
fn every_stage_computes_the_same_result() {
    let json = r#"{
        "globals": [{ "name": "odd", "initializer": { "integer": 0 } }],
        "functions": [{
            "name": "main",
            "returns_value": true,
            "body": [
                { "declare": { "variable": { "name": "sum", "storage": { "local": 0 } }, "initializer": { "integer": 0 } } },
                { "for": {
                    "initializer": [{ "declare": { "variable": { "name": "i", "storage": { "local": 1 } }, "initializer": { "integer": 0 } } }],
                    "condition": { "compare": { "operator": "less", "lhs": { "variable": { "name": "i", "storage": { "local": 1 } } }, "rhs": { "integer": 10 } } },
                    "step": [{ "assign": { "target": { "variable": { "name": "i", "storage": { "local": 1 } } }, "value": { "binary": { "operator": "add", "lhs": { "variable": { "name": "i", "storage": { "local": 1 } } }, "rhs": { "integer": 1 } } } } }],
                    "body": [{ "if": {
                        "condition": { "compare": { "operator": "equal", "lhs": { "binary": { "operator": "modulo", "lhs": { "variable": { "name": "i", "storage": { "local": 1 } } }, "rhs": { "integer": 2 } } }, "rhs": { "integer": 0 } } },
                        "then_branch": [{ "assign": { "target": { "variable": { "name": "sum", "storage": { "local": 0 } } }, "value": { "binary": { "operator": "add", "lhs": { "variable": { "name": "sum", "storage": { "local": 0 } } }, "rhs": { "variable": { "name": "i", "storage": { "local": 1 } } } } } } }],
                        "else_branch": [{ "assign": { "target": { "variable": { "name": "odd", "storage": "global" } }, "value": { "binary": { "operator": "add", "lhs": { "variable": { "name": "odd", "storage": "global" } }, "rhs": { "integer": 1 } } } } }]
                    } }]
                } },
                { "return": { "binary": {
                    "operator": "add",
                    "lhs": { "binary": { "operator": "multiply", "lhs": { "variable": { "name": "sum", "storage": { "local": 0 } } }, "rhs": { "integer": 100 } } },
                    "rhs": { "variable": { "name": "odd", "storage": "global" } }
                } } }
            ]
        }]
    }"#;

    let program = parse_program(json).unwrap();

    for stage in [Stage::Raw, Stage::Ssa, Stage::Ir] {
        let module = lower(&program, &stop_after(stage)).unwrap();
        let execution = run_module(&module, 100_000).unwrap();

        assert_eq!(execution.return_value, 2005, "after {stage}");
        assert_eq!(execution.globals, [5], "after {stage}");
    }
}

#[test]
fn emission_is_deterministic() {
    let program = if_without_else();
    let options = CompileOptions::default();

    let first = compile(&program, &BTreeMap::new(), &options).unwrap();
    let second = compile(&program, &BTreeMap::new(), &options).unwrap();

    assert_eq!(first, second);
}

#[test]
fn ir_stages_print_instead_of_emitting() {
    let output = compile(
        &if_without_else(),
        &BTreeMap::new(),
        &stop_after(Stage::Ssa),
    )
    .unwrap();
    let plain = strip_ansi_escapes::strip_str(&output);

    assert!(plain.starts_with("fn pick(1) {"));
    assert!(plain.contains("phi"));
    assert!(!plain.contains("SECTION"));
}
