//! Collector behavior over real bytecode: transient garbage is reclaimed,
//! reachable objects survive with identical contents, weak references clear
//! when their referent dies.

mod common;

use common::*;
use valka_runtime::vm::Value;

#[test]
fn transient_allocations_do_not_exhaust_the_heap() {
    // for (i = 0; i < 20000; i++) { latest = new byte[1024]; }
    // Only the latest array stays reachable; the loop allocates roughly
    // 20 MiB against an 8 MiB heap, so the collector has to run.
    let mut code = vec![op(J::Iconst0), op(J::Istore0)];
    // 2:
    code.push(op(J::Iload0));
    code.push(op(J::Sipush));
    code.extend_from_slice(&20000i16.to_be_bytes());
    // 6: if_icmpge -> 21
    code.push(op(J::IfIcmpge));
    code.extend_from_slice(&15i16.to_be_bytes());
    // 9: new byte[1024]
    code.push(op(J::Sipush));
    code.extend_from_slice(&1024i16.to_be_bytes());
    code.push(op(J::Newarray));
    code.push(8); // byte
    code.push(op(J::Astore1));
    // 15: i++
    code.push(op(J::Iinc));
    code.push(0);
    code.push(1);
    // 18: goto 2
    code.push(op(J::Goto));
    code.extend_from_slice(&(-16i16).to_be_bytes());
    // 21:
    code.push(op(J::Return));

    let class = ClassBuilder::new("T", "java/lang/Object")
        .method(ACC_PUBLIC | ACC_STATIC, "churn", "()V", 2, 2, code)
        .build();

    let mut t = boot_vm(vec![class]);
    let before_free = t.vm.heap.free_memory();
    t.call_static("T", "churn", "()V", vec![]).unwrap();

    // The heap settled instead of growing without bound.
    let after_free = t.vm.heap.free_memory();
    assert!(t.vm.heap.total_memory() <= 8 * 1024 * 1024);
    assert!(after_free > 0);
    // Allow for arena growth, but the live set at the end is tiny.
    assert!(after_free * 10 > before_free, "heap nearly exhausted after churn");
}

#[test]
fn reachable_objects_survive_collection_intact() {
    let mut b = ClassBuilder::new("K", "java/lang/Object").field(ACC_STATIC, "kept", "[I");
    let kept_ref = b.pool.field_ref("K", "kept", "[I");

    // kept = new int[4]; kept[2] = 1234;
    let mut setup = vec![op(J::Iconst4), op(J::Newarray), 10, op(J::Astore0)];
    setup.push(op(J::Aload0));
    setup.push(op(J::Iconst2));
    setup.push(op(J::Sipush));
    setup.extend_from_slice(&1234i16.to_be_bytes());
    setup.push(op(J::Iastore));
    setup.push(op(J::Aload0));
    setup.extend_from_slice(&with_u16(J::Putstatic, kept_ref));
    setup.push(op(J::Return));

    let mut read = with_u16(J::Getstatic, kept_ref);
    read.push(op(J::Iconst2));
    read.push(op(J::Iaload));
    read.push(op(J::Ireturn));

    let class = b
        .method(ACC_PUBLIC | ACC_STATIC, "setup", "()V", 3, 1, setup)
        .method(ACC_PUBLIC | ACC_STATIC, "read", "()I", 2, 0, read)
        .build();

    let mut t = boot_vm(vec![class]);
    t.call_static("K", "setup", "()V", vec![]).unwrap();
    t.vm.request_gc(&t.thread);
    t.vm.request_gc(&t.thread);
    assert_eq!(
        t.call_static("K", "read", "()I", vec![]).unwrap(),
        Some(Value::Integer(1234))
    );
}

#[test]
fn weak_reference_clears_when_referent_dies() {
    let mut b = ClassBuilder::new("W", "java/lang/Object")
        .field(ACC_STATIC, "weak", "Ljava/lang/ref/WeakReference;")
        .field(ACC_STATIC, "strongWeak", "Ljava/lang/ref/WeakReference;")
        .field(ACC_STATIC, "strong", "Ljava/lang/Object;");

    let weak_ref = b.pool.field_ref("W", "weak", "Ljava/lang/ref/WeakReference;");
    let strong_weak_ref = b.pool.field_ref("W", "strongWeak", "Ljava/lang/ref/WeakReference;");
    let strong_ref = b.pool.field_ref("W", "strong", "Ljava/lang/Object;");
    let wr_class = b.pool.class("java/lang/ref/WeakReference");
    let object_class = b.pool.class("java/lang/Object");
    let object_init = b.pool.method_ref("java/lang/Object", "<init>", "()V");
    let wr_init = b
        .pool
        .method_ref("java/lang/ref/WeakReference", "<init>", "(Ljava/lang/Object;)V");
    let wr_get = b
        .pool
        .method_ref("java/lang/ref/WeakReference", "get", "()Ljava/lang/Object;");

    // weak = new WeakReference(new Object()); nothing else keeps the
    // referent alive.
    let mut mk = with_u16(J::New, wr_class);
    mk.push(op(J::Dup));
    mk.extend_from_slice(&with_u16(J::New, object_class));
    mk.push(op(J::Dup));
    mk.extend_from_slice(&with_u16(J::Invokespecial, object_init));
    mk.extend_from_slice(&with_u16(J::Invokespecial, wr_init));
    mk.extend_from_slice(&with_u16(J::Putstatic, weak_ref));
    mk.push(op(J::Return));

    // strong = new Object(); strongWeak = new WeakReference(strong);
    let mut mk2 = with_u16(J::New, object_class);
    mk2.push(op(J::Dup));
    mk2.extend_from_slice(&with_u16(J::Invokespecial, object_init));
    mk2.extend_from_slice(&with_u16(J::Putstatic, strong_ref));
    mk2.extend_from_slice(&with_u16(J::New, wr_class));
    mk2.push(op(J::Dup));
    mk2.extend_from_slice(&with_u16(J::Getstatic, strong_ref));
    mk2.extend_from_slice(&with_u16(J::Invokespecial, wr_init));
    mk2.extend_from_slice(&with_u16(J::Putstatic, strong_weak_ref));
    mk2.push(op(J::Return));

    // weak.get() == null ? 1 : 0
    let mut gone = with_u16(J::Getstatic, weak_ref);
    gone.extend_from_slice(&with_u16(J::Invokevirtual, wr_get));
    gone.push(op(J::Ifnull));
    gone.extend_from_slice(&5i16.to_be_bytes());
    gone.push(op(J::Iconst0));
    gone.push(op(J::Ireturn));
    gone.push(op(J::Iconst1));
    gone.push(op(J::Ireturn));

    // strongWeak.get() != null ? 1 : 0
    let mut kept = with_u16(J::Getstatic, strong_weak_ref);
    kept.extend_from_slice(&with_u16(J::Invokevirtual, wr_get));
    kept.push(op(J::Ifnonnull));
    kept.extend_from_slice(&5i16.to_be_bytes());
    kept.push(op(J::Iconst0));
    kept.push(op(J::Ireturn));
    kept.push(op(J::Iconst1));
    kept.push(op(J::Ireturn));

    let class = b
        .method(ACC_PUBLIC | ACC_STATIC, "mk", "()V", 4, 0, mk)
        .method(ACC_PUBLIC | ACC_STATIC, "mk2", "()V", 3, 0, mk2)
        .method(ACC_PUBLIC | ACC_STATIC, "weakGone", "()I", 2, 0, gone)
        .method(ACC_PUBLIC | ACC_STATIC, "strongKept", "()I", 2, 0, kept)
        .build();

    let mut t = boot_vm(vec![class]);
    t.call_static("W", "mk", "()V", vec![]).unwrap();
    t.call_static("W", "mk2", "()V", vec![]).unwrap();

    t.vm.request_gc(&t.thread);

    assert_eq!(
        t.call_static("W", "weakGone", "()I", vec![]).unwrap(),
        Some(Value::Integer(1)),
        "unreferenced referent should have been cleared"
    );
    assert_eq!(
        t.call_static("W", "strongKept", "()I", vec![]).unwrap(),
        Some(Value::Integer(1)),
        "strongly held referent must survive"
    );
}

#[test]
fn interned_literals_survive_collection() {
    let mut b = ClassBuilder::new("T", "java/lang/Object");
    let s_idx = b.pool.string("pinned literal");
    let length = b.pool.method_ref("java/lang/String", "length", "()I");

    let mut code = vec![op(J::Ldc), s_idx as u8];
    code.extend_from_slice(&with_u16(J::Invokevirtual, length));
    code.push(op(J::Ireturn));

    let class = b
        .method(ACC_PUBLIC | ACC_STATIC, "len", "()I", 1, 0, code)
        .build();

    let mut t = boot_vm(vec![class]);
    assert_eq!(
        t.call_static("T", "len", "()I", vec![]).unwrap(),
        Some(Value::Integer(14))
    );
    t.vm.request_gc(&t.thread);
    // The rewritten ldc hands out the pinned instance after collection.
    assert_eq!(
        t.call_static("T", "len", "()I", vec![]).unwrap(),
        Some(Value::Integer(14))
    );
}
