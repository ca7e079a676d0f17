//! End-to-end interpreter coverage over synthetic class files: arithmetic
//! edge cases, dispatch forms, field access, exception unwinding, switches
//! and the in-place prelink rewriting they all ride on.

mod common;

use common::*;
use valka_runtime::vm::Value;

fn one_method_class(
    name: &str,
    method: &str,
    desc: &str,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
) -> (String, Vec<u8>) {
    ClassBuilder::new(name, "java/lang/Object")
        .method(ACC_PUBLIC | ACC_STATIC, method, desc, max_stack, max_locals, code)
        .build()
}

#[test]
fn iconst_iadd_ireturn_yields_five() {
    let class = one_method_class(
        "T",
        "add",
        "()I",
        2,
        0,
        vec![op(J::Iconst2), op(J::Iconst3), op(J::Iadd), op(J::Ireturn)],
    );
    let mut t = boot_vm(vec![class]);
    let result = t.call_static("T", "add", "()I", vec![]).unwrap();
    assert_eq!(result, Some(Value::Integer(5)));
}

#[test]
fn invokevirtual_on_null_raises_npe() {
    let mut b = ClassBuilder::new("T", "java/lang/Object")
        .method(ACC_PUBLIC, "m", "()V", 0, 1, empty_body());
    let m_ref = b.pool.method_ref("T", "m", "()V");
    let mut code = vec![op(J::AconstNull)];
    code.extend_from_slice(&with_u16(J::Invokevirtual, m_ref));
    code.push(op(J::Return));
    let class = b
        .method(ACC_PUBLIC | ACC_STATIC, "npe", "()V", 1, 0, code)
        .build();

    let mut t = boot_vm(vec![class]);
    let thrown = t.call_static_expect_throw("T", "npe", "()V", vec![]);
    assert_eq!(thrown, "java.lang.NullPointerException");
}

/// Classes A (foo -> 1) and B extends A (foo -> 2), plus B.callParent which
/// reaches A.foo through the ACC_SUPER invokespecial path.
fn dispatch_pair() -> Vec<(String, Vec<u8>)> {
    let mut a = ClassBuilder::new("A", "java/lang/Object");
    let a_init = ctor_body(&mut a.pool, "java/lang/Object");
    let a = a
        .method(ACC_PUBLIC, "<init>", "()V", 1, 1, a_init)
        .method(
            ACC_PUBLIC,
            "foo",
            "()I",
            1,
            1,
            vec![op(J::Iconst1), op(J::Ireturn)],
        )
        .build();

    let mut b = ClassBuilder::new("B", "A");
    let b_init = ctor_body(&mut b.pool, "A");
    let a_foo = b.pool.method_ref("A", "foo", "()I");
    let mut call_parent = vec![op(J::Aload0)];
    call_parent.extend_from_slice(&with_u16(J::Invokespecial, a_foo));
    call_parent.push(op(J::Ireturn));
    let b = b
        .method(ACC_PUBLIC, "<init>", "()V", 1, 1, b_init)
        .method(
            ACC_PUBLIC,
            "foo",
            "()I",
            1,
            1,
            vec![op(J::Iconst2), op(J::Ireturn)],
        )
        .method(ACC_PUBLIC, "callParent", "()I", 1, 1, call_parent)
        .build();

    vec![a, b]
}

#[test]
fn override_dispatches_through_the_receiver() {
    let mut classes = dispatch_pair();
    let mut driver = ClassBuilder::new("T", "java/lang/Object");
    let b_class = driver.pool.class("B");
    let b_init = driver.pool.method_ref("B", "<init>", "()V");
    let a_foo = driver.pool.method_ref("A", "foo", "()I");
    let mut code = with_u16(J::New, b_class);
    code.push(op(J::Dup));
    code.extend_from_slice(&with_u16(J::Invokespecial, b_init));
    code.extend_from_slice(&with_u16(J::Invokevirtual, a_foo));
    code.push(op(J::Ireturn));
    classes.push(
        driver
            .method(ACC_PUBLIC | ACC_STATIC, "run", "()I", 2, 0, code)
            .build(),
    );

    let mut t = boot_vm(classes);
    let result = t.call_static("T", "run", "()I", vec![]).unwrap();
    // B overrides foo, so invoking through the A-typed site reaches B.
    assert_eq!(result, Some(Value::Integer(2)));
}

#[test]
fn invokespecial_super_reaches_the_parent() {
    let mut classes = dispatch_pair();
    let mut driver = ClassBuilder::new("T", "java/lang/Object");
    let b_class = driver.pool.class("B");
    let b_init = driver.pool.method_ref("B", "<init>", "()V");
    let call_parent = driver.pool.method_ref("B", "callParent", "()I");
    let mut code = with_u16(J::New, b_class);
    code.push(op(J::Dup));
    code.extend_from_slice(&with_u16(J::Invokespecial, b_init));
    code.extend_from_slice(&with_u16(J::Invokevirtual, call_parent));
    code.push(op(J::Ireturn));
    classes.push(
        driver
            .method(ACC_PUBLIC | ACC_STATIC, "run", "()I", 2, 0, code)
            .build(),
    );

    let mut t = boot_vm(classes);
    let result = t.call_static("T", "run", "()I", vec![]).unwrap();
    assert_eq!(result, Some(Value::Integer(1)));
}

#[test]
fn interface_invocation_selects_the_implementation() {
    let iface = ClassBuilder::interface("I")
        .abstract_method(ACC_PUBLIC, "bar", "()I")
        .build();

    let mut c = ClassBuilder::new("C", "java/lang/Object").implements("I");
    let c_init = ctor_body(&mut c.pool, "java/lang/Object");
    let c = c
        .method(ACC_PUBLIC, "<init>", "()V", 1, 1, c_init)
        .method(
            ACC_PUBLIC,
            "bar",
            "()I",
            1,
            1,
            vec![op(J::Bipush), 7, op(J::Ireturn)],
        )
        .build();

    let mut driver = ClassBuilder::new("T", "java/lang/Object");
    let c_class = driver.pool.class("C");
    let c_init_ref = driver.pool.method_ref("C", "<init>", "()V");
    let i_bar = driver.pool.interface_method_ref("I", "bar", "()I");
    let mut code = with_u16(J::New, c_class);
    code.push(op(J::Dup));
    code.extend_from_slice(&with_u16(J::Invokespecial, c_init_ref));
    code.extend_from_slice(&with_u16(J::Invokeinterface, i_bar));
    code.push(1); // count
    code.push(0);
    code.push(op(J::Ireturn));
    let driver = driver
        .method(ACC_PUBLIC | ACC_STATIC, "run", "()I", 2, 0, code)
        .build();

    let mut t = boot_vm(vec![iface, c, driver]);
    let result = t.call_static("T", "run", "()I", vec![]).unwrap();
    assert_eq!(result, Some(Value::Integer(7)));
}

// ---------------------------------------------------------------------
// Arithmetic edge cases
// ---------------------------------------------------------------------

fn binop_class(name: &str, desc: &str, body: Vec<u8>, locals: u16) -> (String, Vec<u8>) {
    one_method_class(name, "f", desc, 4, locals, body)
}

#[test]
fn idiv_edge_cases() {
    let class = binop_class(
        "T",
        "(II)I",
        vec![op(J::Iload0), op(J::Iload1), op(J::Idiv), op(J::Ireturn)],
        2,
    );
    let mut t = boot_vm(vec![class]);

    let r = t
        .call_static("T", "f", "(II)I", vec![Value::Integer(i32::MIN), Value::Integer(-1)])
        .unwrap();
    // Overflowing division returns the dividend unchanged.
    assert_eq!(r, Some(Value::Integer(i32::MIN)));

    let thrown =
        t.call_static_expect_throw("T", "f", "(II)I", vec![Value::Integer(1), Value::Integer(0)]);
    assert_eq!(thrown, "java.lang.ArithmeticException");
}

#[test]
fn irem_edge_cases() {
    let class = binop_class(
        "T",
        "(II)I",
        vec![op(J::Iload0), op(J::Iload1), op(J::Irem), op(J::Ireturn)],
        2,
    );
    let mut t = boot_vm(vec![class]);

    let r = t
        .call_static("T", "f", "(II)I", vec![Value::Integer(i32::MIN), Value::Integer(-1)])
        .unwrap();
    assert_eq!(r, Some(Value::Integer(0)));

    let thrown =
        t.call_static_expect_throw("T", "f", "(II)I", vec![Value::Integer(5), Value::Integer(0)]);
    assert_eq!(thrown, "java.lang.ArithmeticException");
}

#[test]
fn shift_counts_are_masked() {
    let class = binop_class(
        "T",
        "(II)I",
        vec![op(J::Iload0), op(J::Iload1), op(J::Ishl), op(J::Ireturn)],
        2,
    );
    let mut t = boot_vm(vec![class]);
    let r = t
        .call_static("T", "f", "(II)I", vec![Value::Integer(1), Value::Integer(33)])
        .unwrap();
    assert_eq!(r, Some(Value::Integer(2)));
}

#[test]
fn iushr_is_logical() {
    let class = binop_class(
        "T",
        "(II)I",
        vec![op(J::Iload0), op(J::Iload1), op(J::Iushr), op(J::Ireturn)],
        2,
    );
    let mut t = boot_vm(vec![class]);
    let r = t
        .call_static("T", "f", "(II)I", vec![Value::Integer(-1), Value::Integer(28)])
        .unwrap();
    assert_eq!(r, Some(Value::Integer(0xF)));
}

#[test]
fn lcmp_orders_extreme_longs() {
    let class = binop_class(
        "T",
        "(JJ)I",
        vec![op(J::Lload0), op(J::Lload2), op(J::Lcmp), op(J::Ireturn)],
        4,
    );
    let mut t = boot_vm(vec![class]);

    let cases = [
        (i64::MIN, i64::MAX, -1),
        (i64::MAX, i64::MIN, 1),
        (3, 3, 0),
        (-1, 1, -1),
    ];
    for (a, b, expected) in cases {
        let r = t
            .call_static("T", "f", "(JJ)I", vec![Value::Long(a), Value::Long(b)])
            .unwrap();
        assert_eq!(r, Some(Value::Integer(expected)), "lcmp({}, {})", a, b);
    }
}

#[test]
fn float_compare_nan_polarity() {
    let l = binop_class(
        "L",
        "(FF)I",
        vec![op(J::Fload0), op(J::Fload1), op(J::Fcmpl), op(J::Ireturn)],
        2,
    );
    let g = binop_class(
        "G",
        "(FF)I",
        vec![op(J::Fload0), op(J::Fload1), op(J::Fcmpg), op(J::Ireturn)],
        2,
    );
    let mut t = boot_vm(vec![l, g]);

    let nan = Value::Float(f32::NAN);
    let one = Value::Float(1.0);
    assert_eq!(
        t.call_static("L", "f", "(FF)I", vec![nan, one]).unwrap(),
        Some(Value::Integer(-1))
    );
    assert_eq!(
        t.call_static("G", "f", "(FF)I", vec![nan, one]).unwrap(),
        Some(Value::Integer(1))
    );
    assert_eq!(
        t.call_static("L", "f", "(FF)I", vec![Value::Float(2.0), one]).unwrap(),
        Some(Value::Integer(1))
    );
}

#[test]
fn narrowing_conversions_extend_correctly() {
    let b = one_method_class(
        "B",
        "f",
        "(I)I",
        1,
        1,
        vec![op(J::Iload0), op(J::I2b), op(J::Ireturn)],
    );
    let c = one_method_class(
        "C",
        "f",
        "(I)I",
        1,
        1,
        vec![op(J::Iload0), op(J::I2c), op(J::Ireturn)],
    );
    let s = one_method_class(
        "S",
        "f",
        "(I)I",
        1,
        1,
        vec![op(J::Iload0), op(J::I2s), op(J::Ireturn)],
    );
    let mut t = boot_vm(vec![b, c, s]);

    assert_eq!(
        t.call_static("B", "f", "(I)I", vec![Value::Integer(300)]).unwrap(),
        Some(Value::Integer(44))
    );
    assert_eq!(
        t.call_static("C", "f", "(I)I", vec![Value::Integer(-1)]).unwrap(),
        Some(Value::Integer(65535))
    );
    assert_eq!(
        t.call_static("S", "f", "(I)I", vec![Value::Integer(0x18000)]).unwrap(),
        Some(Value::Integer(-32768))
    );
}

#[test]
fn frem_by_zero_is_nan() {
    let class = binop_class(
        "T",
        "(FF)F",
        vec![op(J::Fload0), op(J::Fload1), op(J::Frem), op(J::Freturn)],
        2,
    );
    let mut t = boot_vm(vec![class]);
    let r = t
        .call_static("T", "f", "(FF)F", vec![Value::Float(5.0), Value::Float(0.0)])
        .unwrap();
    match r {
        Some(Value::Float(v)) => assert!(v.is_nan()),
        other => panic!("expected a float, got {:?}", other),
    }
}

// ---------------------------------------------------------------------
// Exception unwinding
// ---------------------------------------------------------------------

#[test]
fn handler_catches_implicit_arithmetic_exception() {
    let code = vec![
        op(J::Iconst1),
        op(J::Iconst0),
        op(J::Idiv),
        op(J::Ireturn),
        // handler: drop the exception, answer 9
        op(J::Pop),
        op(J::Bipush),
        9,
        op(J::Ireturn),
    ];
    let class = ClassBuilder::new("T", "java/lang/Object")
        .method_with_handlers(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "()I",
            2,
            0,
            code,
            vec![Handler {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 4,
                catch_type: Some("java/lang/ArithmeticException".to_string()),
            }],
        )
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "f", "()I", vec![]).unwrap(),
        Some(Value::Integer(9))
    );
}

#[test]
fn handler_matches_a_parent_catch_type() {
    let code = vec![
        op(J::Iconst1),
        op(J::Iconst0),
        op(J::Idiv),
        op(J::Ireturn),
        op(J::Pop),
        op(J::Bipush),
        3,
        op(J::Ireturn),
    ];
    let class = ClassBuilder::new("T", "java/lang/Object")
        .method_with_handlers(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "()I",
            2,
            0,
            code,
            vec![Handler {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 4,
                catch_type: Some("java/lang/Exception".to_string()),
            }],
        )
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "f", "()I", vec![]).unwrap(),
        Some(Value::Integer(3))
    );
}

#[test]
fn unwinding_reaches_the_caller_frame_handler() {
    let mut b = ClassBuilder::new("T", "java/lang/Object").method(
        ACC_PUBLIC | ACC_STATIC,
        "thrower",
        "()V",
        2,
        0,
        vec![op(J::Iconst1), op(J::Iconst0), op(J::Idiv), op(J::Pop), op(J::Return)],
    );
    let thrower_ref = b.pool.method_ref("T", "thrower", "()V");
    let mut code = with_u16(J::Invokestatic, thrower_ref);
    code.push(op(J::Iconst0));
    code.push(op(J::Ireturn));
    code.push(op(J::Pop));
    code.push(op(J::Bipush));
    code.push(7);
    code.push(op(J::Ireturn));
    let class = b
        .method_with_handlers(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "()I",
            2,
            0,
            code,
            // Covers the invocation site; the exception escapes the callee
            // and must match here.
            vec![Handler {
                start_pc: 0,
                end_pc: 3,
                handler_pc: 5,
                catch_type: Some("java/lang/ArithmeticException".to_string()),
            }],
        )
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "f", "()I", vec![]).unwrap(),
        Some(Value::Integer(7))
    );
}

#[test]
fn athrow_of_a_constructed_exception() {
    let mut b = ClassBuilder::new("T", "java/lang/Object");
    let ae_class = b.pool.class("java/lang/ArithmeticException");
    let ae_init = b.pool.method_ref("java/lang/ArithmeticException", "<init>", "()V");
    let mut code = with_u16(J::New, ae_class);
    code.push(op(J::Dup));
    code.extend_from_slice(&with_u16(J::Invokespecial, ae_init));
    code.push(op(J::Athrow));
    code.push(op(J::Pop));
    code.push(op(J::Iconst5));
    code.push(op(J::Ireturn));
    let class = b
        .method_with_handlers(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "()I",
            2,
            0,
            code,
            vec![Handler {
                start_pc: 0,
                end_pc: 8,
                handler_pc: 8,
                catch_type: None,
            }],
        )
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "f", "()I", vec![]).unwrap(),
        Some(Value::Integer(5))
    );
}

#[test]
fn athrow_of_null_raises_npe() {
    let class = one_method_class(
        "T",
        "f",
        "()V",
        1,
        0,
        vec![op(J::AconstNull), op(J::Athrow)],
    );
    let mut t = boot_vm(vec![class]);
    let thrown = t.call_static_expect_throw("T", "f", "()V", vec![]);
    assert_eq!(thrown, "java.lang.NullPointerException");
}

// ---------------------------------------------------------------------
// Fields and statics
// ---------------------------------------------------------------------

#[test]
fn instance_fields_roundtrip_including_packed_booleans() {
    let mut b = ClassBuilder::new("F", "java/lang/Object")
        .field(ACC_PRIVATE, "b", "B")
        .field(ACC_PRIVATE, "flag", "Z")
        .field(ACC_PRIVATE, "flag2", "Z")
        .field(ACC_PRIVATE, "i", "I");
    let f_init = ctor_body(&mut b.pool, "java/lang/Object");
    let f_class = b.pool.class("F");
    let f_init_ref = b.pool.method_ref("F", "<init>", "()V");
    let i_ref = b.pool.field_ref("F", "i", "I");
    let flag_ref = b.pool.field_ref("F", "flag", "Z");
    let flag2_ref = b.pool.field_ref("F", "flag2", "Z");

    let mut code = with_u16(J::New, f_class);
    code.push(op(J::Dup));
    code.extend_from_slice(&with_u16(J::Invokespecial, f_init_ref));
    code.push(op(J::Astore0));
    // f.i = 7
    code.push(op(J::Aload0));
    code.push(op(J::Bipush));
    code.push(7);
    code.extend_from_slice(&with_u16(J::Putfield, i_ref));
    // f.flag = true
    code.push(op(J::Aload0));
    code.push(op(J::Iconst1));
    code.extend_from_slice(&with_u16(J::Putfield, flag_ref));
    // f.i + f.flag + f.flag2
    code.push(op(J::Aload0));
    code.extend_from_slice(&with_u16(J::Getfield, i_ref));
    code.push(op(J::Aload0));
    code.extend_from_slice(&with_u16(J::Getfield, flag_ref));
    code.push(op(J::Iadd));
    code.push(op(J::Aload0));
    code.extend_from_slice(&with_u16(J::Getfield, flag2_ref));
    code.push(op(J::Iadd));
    code.push(op(J::Ireturn));

    let class = b
        .method(ACC_PUBLIC, "<init>", "()V", 1, 1, f_init)
        .method(ACC_PUBLIC | ACC_STATIC, "drive", "()I", 3, 1, code)
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("F", "drive", "()I", vec![]).unwrap(),
        Some(Value::Integer(8))
    );
}

#[test]
fn long_fields_keep_their_value() {
    let mut b = ClassBuilder::new("F", "java/lang/Object").field(ACC_PRIVATE, "l", "J");
    let f_init = ctor_body(&mut b.pool, "java/lang/Object");
    let f_class = b.pool.class("F");
    let f_init_ref = b.pool.method_ref("F", "<init>", "()V");
    let l_ref = b.pool.field_ref("F", "l", "J");

    let mut code = with_u16(J::New, f_class);
    code.push(op(J::Dup));
    code.extend_from_slice(&with_u16(J::Invokespecial, f_init_ref));
    code.push(op(J::Astore2));
    code.push(op(J::Aload2));
    code.push(op(J::Lload0));
    code.extend_from_slice(&with_u16(J::Putfield, l_ref));
    code.push(op(J::Aload2));
    code.extend_from_slice(&with_u16(J::Getfield, l_ref));
    code.push(op(J::Lreturn));

    let class = b
        .method(ACC_PUBLIC, "<init>", "()V", 1, 1, f_init)
        .method(ACC_PUBLIC | ACC_STATIC, "drive", "(J)J", 4, 3, code)
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("F", "drive", "(J)J", vec![Value::Long(-77)]).unwrap(),
        Some(Value::Long(-77))
    );
}

#[test]
fn clinit_runs_exactly_once() {
    let mut b = ClassBuilder::new("S", "java/lang/Object").field(ACC_STATIC, "x", "I");
    let x_ref = b.pool.field_ref("S", "x", "I");

    let mut clinit = vec![op(J::Bipush), 42];
    clinit.extend_from_slice(&with_u16(J::Putstatic, x_ref));
    clinit.push(op(J::Return));

    let mut get = with_u16(J::Getstatic, x_ref);
    get.push(op(J::Ireturn));

    let mut bump = with_u16(J::Getstatic, x_ref);
    bump.push(op(J::Iconst1));
    bump.push(op(J::Iadd));
    bump.extend_from_slice(&with_u16(J::Putstatic, x_ref));
    bump.push(op(J::Return));

    let class = b
        .method(ACC_STATIC, "<clinit>", "()V", 2, 0, clinit)
        .method(ACC_PUBLIC | ACC_STATIC, "get", "()I", 1, 0, get)
        .method(ACC_PUBLIC | ACC_STATIC, "bump", "()V", 2, 0, bump)
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(t.call_static("S", "get", "()I", vec![]).unwrap(), Some(Value::Integer(42)));
    t.call_static("S", "bump", "()V", vec![]).unwrap();
    // A second use must not re-run <clinit> and reset the counter.
    assert_eq!(t.call_static("S", "get", "()I", vec![]).unwrap(), Some(Value::Integer(43)));
}

#[test]
fn ldc_string_is_interned_once() {
    let mut b = ClassBuilder::new("T", "java/lang/Object");
    let s_idx = b.pool.string("the one string");
    assert!(s_idx <= 0xFF);

    let code = vec![
        op(J::Ldc),
        s_idx as u8,
        op(J::Ldc),
        s_idx as u8,
        op(J::IfAcmpeq),
        0,
        5, // -> 9
        op(J::Iconst0),
        op(J::Ireturn),
        op(J::Iconst1),
        op(J::Ireturn),
    ];
    let class = b
        .method(ACC_PUBLIC | ACC_STATIC, "same", "()I", 2, 0, code)
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "same", "()I", vec![]).unwrap(),
        Some(Value::Integer(1))
    );
}

#[test]
fn string_constant_statics_assign_at_initialization() {
    let mut b = ClassBuilder::new("T", "java/lang/Object").string_constant("GREETING", "hei");
    let field_ref = b.pool.field_ref("T", "GREETING", "Ljava/lang/String;");
    let length = b.pool.method_ref("java/lang/String", "length", "()I");
    let mut code = with_u16(J::Getstatic, field_ref);
    code.extend_from_slice(&with_u16(J::Invokevirtual, length));
    code.push(op(J::Ireturn));
    let class = b
        .method(ACC_PUBLIC | ACC_STATIC, "len", "()I", 1, 0, code)
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "len", "()I", vec![]).unwrap(),
        Some(Value::Integer(3))
    );
}

// ---------------------------------------------------------------------
// Switches, wide forms, recursion
// ---------------------------------------------------------------------

#[test]
fn tableswitch_selects_and_defaults() {
    let mut code = vec![op(J::Iload0), op(J::Tableswitch), 0, 0];
    code.extend_from_slice(&36i32.to_be_bytes()); // default -> 37
    code.extend_from_slice(&0i32.to_be_bytes()); // low
    code.extend_from_slice(&2i32.to_be_bytes()); // high
    code.extend_from_slice(&27i32.to_be_bytes()); // case 0 -> 28
    code.extend_from_slice(&30i32.to_be_bytes()); // case 1 -> 31
    code.extend_from_slice(&33i32.to_be_bytes()); // case 2 -> 34
    code.extend_from_slice(&[op(J::Bipush), 10, op(J::Ireturn)]);
    code.extend_from_slice(&[op(J::Bipush), 20, op(J::Ireturn)]);
    code.extend_from_slice(&[op(J::Bipush), 30, op(J::Ireturn)]);
    code.extend_from_slice(&[op(J::Bipush), 99, op(J::Ireturn)]);

    let class = one_method_class("T", "sel", "(I)I", 1, 1, code);
    let mut t = boot_vm(vec![class]);

    for (input, expected) in [(0, 10), (1, 20), (2, 30), (5, 99), (-3, 99)] {
        assert_eq!(
            t.call_static("T", "sel", "(I)I", vec![Value::Integer(input)]).unwrap(),
            Some(Value::Integer(expected)),
            "tableswitch({})",
            input
        );
    }
}

#[test]
fn lookupswitch_matches_sparse_keys() {
    let mut code = vec![op(J::Iload0), op(J::Lookupswitch), 0, 0];
    code.extend_from_slice(&31i32.to_be_bytes()); // default -> 32
    code.extend_from_slice(&2i32.to_be_bytes()); // npairs
    code.extend_from_slice(&5i32.to_be_bytes());
    code.extend_from_slice(&27i32.to_be_bytes()); // 5 -> 28
    code.extend_from_slice(&42i32.to_be_bytes());
    code.extend_from_slice(&29i32.to_be_bytes()); // 42 -> 30
    code.extend_from_slice(&[op(J::Iconst1), op(J::Ireturn)]);
    code.extend_from_slice(&[op(J::Iconst2), op(J::Ireturn)]);
    code.extend_from_slice(&[op(J::Iconst0), op(J::Ireturn)]);

    let class = one_method_class("T", "sel", "(I)I", 1, 1, code);
    let mut t = boot_vm(vec![class]);

    for (input, expected) in [(5, 1), (42, 2), (6, 0), (-1, 0)] {
        assert_eq!(
            t.call_static("T", "sel", "(I)I", vec![Value::Integer(input)]).unwrap(),
            Some(Value::Integer(expected)),
            "lookupswitch({})",
            input
        );
    }
}

#[test]
fn wide_iinc_handles_large_constants() {
    let mut code = vec![op(J::Wide), op(J::Iinc)];
    code.extend_from_slice(&0u16.to_be_bytes());
    code.extend_from_slice(&1000i16.to_be_bytes());
    code.push(op(J::Iload0));
    code.push(op(J::Ireturn));

    let class = one_method_class("T", "f", "(I)I", 1, 1, code);
    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "f", "(I)I", vec![Value::Integer(5)]).unwrap(),
        Some(Value::Integer(1005))
    );
}

#[test]
fn recursive_invocation_builds_and_pops_frames() {
    let mut b = ClassBuilder::new("T", "java/lang/Object");
    let fib_self = b.pool.method_ref("T", "fib", "(I)I");

    let mut code = vec![
        op(J::Iload0),
        op(J::Iconst2),
        op(J::IfIcmpge),
        0,
        5, // -> 7
        op(J::Iload0),
        op(J::Ireturn),
        op(J::Iload0),
        op(J::Iconst1),
        op(J::Isub),
    ];
    code.extend_from_slice(&with_u16(J::Invokestatic, fib_self));
    code.push(op(J::Iload0));
    code.push(op(J::Iconst2));
    code.push(op(J::Isub));
    code.extend_from_slice(&with_u16(J::Invokestatic, fib_self));
    code.push(op(J::Iadd));
    code.push(op(J::Ireturn));

    let class = b
        .method(ACC_PUBLIC | ACC_STATIC, "fib", "(I)I", 4, 1, code)
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "fib", "(I)I", vec![Value::Integer(10)]).unwrap(),
        Some(Value::Integer(55))
    );
}

// ---------------------------------------------------------------------
// Arrays and type tests
// ---------------------------------------------------------------------

#[test]
fn primitive_array_store_load_and_length() {
    let code = vec![
        op(J::Bipush),
        10,
        op(J::Newarray),
        10, // int
        op(J::Astore0),
        op(J::Aload0),
        op(J::Iconst3),
        op(J::Iconst5),
        op(J::Iastore),
        op(J::Aload0),
        op(J::Iconst3),
        op(J::Iaload),
        op(J::Aload0),
        op(J::Arraylength),
        op(J::Iadd),
        op(J::Ireturn),
    ];
    let class = one_method_class("T", "f", "()I", 3, 1, code);
    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "f", "()I", vec![]).unwrap(),
        Some(Value::Integer(15))
    );
}

#[test]
fn array_index_out_of_bounds_is_thrown() {
    let code = vec![
        op(J::Iconst2),
        op(J::Newarray),
        10,
        op(J::Astore1),
        op(J::Aload1),
        op(J::Iload0),
        op(J::Iaload),
        op(J::Ireturn),
    ];
    let class = one_method_class("T2", "f", "(I)I", 2, 2, code);
    let mut t = boot_vm(vec![class]);

    for bad in [-1, 2, 100] {
        let thrown = t.call_static_expect_throw("T2", "f", "(I)I", vec![Value::Integer(bad)]);
        assert_eq!(thrown, "java.lang.ArrayIndexOutOfBoundsException");
    }
    assert_eq!(
        t.call_static("T2", "f", "(I)I", vec![Value::Integer(1)]).unwrap(),
        Some(Value::Integer(0))
    );
}

#[test]
fn negative_array_size_is_thrown() {
    let code = vec![
        op(J::IconstM1),
        op(J::Newarray),
        10,
        op(J::Pop),
        op(J::Return),
    ];
    let class = one_method_class("T", "f", "()V", 1, 0, code);
    let mut t = boot_vm(vec![class]);
    let thrown = t.call_static_expect_throw("T", "f", "()V", vec![]);
    assert_eq!(thrown, "java.lang.NegativeArraySizeException");
}

#[test]
fn reference_array_store_check() {
    let mut classes = dispatch_pair();
    let mut b = ClassBuilder::new("T", "java/lang/Object");
    let a_class = b.pool.class("A");
    let object_class = b.pool.class("java/lang/Object");
    let object_init = b.pool.method_ref("java/lang/Object", "<init>", "()V");

    let mut code = vec![op(J::Iconst1)];
    code.extend_from_slice(&with_u16(J::Anewarray, a_class));
    code.push(op(J::Astore0));
    code.push(op(J::Aload0));
    code.push(op(J::Iconst0));
    code.extend_from_slice(&with_u16(J::New, object_class));
    code.push(op(J::Dup));
    code.extend_from_slice(&with_u16(J::Invokespecial, object_init));
    code.push(op(J::Aastore));
    code.push(op(J::Return));

    classes.push(
        b.method(ACC_PUBLIC | ACC_STATIC, "f", "()V", 4, 1, code)
            .build(),
    );
    let mut t = boot_vm(classes);
    let thrown = t.call_static_expect_throw("T", "f", "()V", vec![]);
    assert_eq!(thrown, "java.lang.ArrayStoreException");
}

#[test]
fn multianewarray_builds_nested_arrays() {
    let mut b = ClassBuilder::new("T", "java/lang/Object");
    let matrix_class = b.pool.class("[[I");
    let mut code = vec![op(J::Iconst3), op(J::Iconst2)];
    code.extend_from_slice(&with_u16(J::Multianewarray, matrix_class));
    code.push(2); // dimensions
    code.push(op(J::Astore0));
    code.push(op(J::Aload0));
    code.push(op(J::Arraylength));
    code.push(op(J::Aload0));
    code.push(op(J::Iconst0));
    code.push(op(J::Aaload));
    code.push(op(J::Arraylength));
    code.push(op(J::Iadd));
    code.push(op(J::Ireturn));

    let class = b
        .method(ACC_PUBLIC | ACC_STATIC, "f", "()I", 3, 1, code)
        .build();
    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "f", "()I", vec![]).unwrap(),
        Some(Value::Integer(5))
    );
}

#[test]
fn instanceof_and_checkcast() {
    let mut classes = dispatch_pair();
    let mut b = ClassBuilder::new("T", "java/lang/Object");
    let b_class = b.pool.class("B");
    let a_class = b.pool.class("A");
    let a_init = b.pool.method_ref("A", "<init>", "()V");
    let b_init = b.pool.method_ref("B", "<init>", "()V");

    // instanceof: new A is not a B, new B is an A.
    let mut is_b = with_u16(J::New, a_class);
    is_b.push(op(J::Dup));
    is_b.extend_from_slice(&with_u16(J::Invokespecial, a_init));
    is_b.extend_from_slice(&with_u16(J::Instanceof, b_class));
    is_b.push(op(J::Ireturn));

    let mut b_is_a = with_u16(J::New, b_class);
    b_is_a.push(op(J::Dup));
    b_is_a.extend_from_slice(&with_u16(J::Invokespecial, b_init));
    b_is_a.extend_from_slice(&with_u16(J::Instanceof, a_class));
    b_is_a.push(op(J::Ireturn));

    // checkcast of an A to B fails.
    let mut bad_cast = with_u16(J::New, a_class);
    bad_cast.push(op(J::Dup));
    bad_cast.extend_from_slice(&with_u16(J::Invokespecial, a_init));
    bad_cast.extend_from_slice(&with_u16(J::Checkcast, b_class));
    bad_cast.push(op(J::Pop));
    bad_cast.push(op(J::Return));

    // checkcast of null always passes.
    let mut null_cast = vec![op(J::AconstNull)];
    null_cast.extend_from_slice(&with_u16(J::Checkcast, b_class));
    null_cast.push(op(J::Pop));
    null_cast.push(op(J::Return));

    classes.push(
        b.method(ACC_PUBLIC | ACC_STATIC, "isB", "()I", 2, 0, is_b)
            .method(ACC_PUBLIC | ACC_STATIC, "bIsA", "()I", 2, 0, b_is_a)
            .method(ACC_PUBLIC | ACC_STATIC, "badCast", "()V", 2, 0, bad_cast)
            .method(ACC_PUBLIC | ACC_STATIC, "nullCast", "()V", 1, 0, null_cast)
            .build(),
    );

    let mut t = boot_vm(classes);
    assert_eq!(t.call_static("T", "isB", "()I", vec![]).unwrap(), Some(Value::Integer(0)));
    assert_eq!(t.call_static("T", "bIsA", "()I", vec![]).unwrap(), Some(Value::Integer(1)));
    let thrown = t.call_static_expect_throw("T", "badCast", "()V", vec![]);
    assert_eq!(thrown, "java.lang.ClassCastException");
    t.call_static("T", "nullCast", "()V", vec![]).unwrap();
}

// ---------------------------------------------------------------------
// Synchronized methods
// ---------------------------------------------------------------------

#[test]
fn synchronized_method_releases_on_return_and_throw() {
    let class = ClassBuilder::new("Y", "java/lang/Object")
        .method(
            ACC_PUBLIC | ACC_STATIC | ACC_SYNCHRONIZED,
            "sget",
            "()I",
            1,
            0,
            vec![op(J::Iconst5), op(J::Ireturn)],
        )
        .method(
            ACC_PUBLIC | ACC_STATIC | ACC_SYNCHRONIZED,
            "sthrow",
            "()V",
            2,
            0,
            vec![op(J::Iconst1), op(J::Iconst0), op(J::Idiv), op(J::Pop), op(J::Return)],
        )
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(t.call_static("Y", "sget", "()I", vec![]).unwrap(), Some(Value::Integer(5)));

    let thrown = t.call_static_expect_throw("Y", "sthrow", "()V", vec![]);
    assert_eq!(thrown, "java.lang.ArithmeticException");

    // The class mirror's monitor is free again after both exits.
    let class_id = t.resolve("Y").unwrap();
    let mirror = {
        let ma = t.vm.method_area_read();
        ma.get_class(&class_id).get_mirror_ref().unwrap()
    };
    assert_eq!(t.vm.monitors.held_by(mirror), None);
}
