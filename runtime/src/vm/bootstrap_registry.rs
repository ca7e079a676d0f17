use crate::keys::{ClassId, FieldKey, MethodKey, Symbol};
use lasso::ThreadedRodeo;

/// Interned names, descriptors and member keys the runtime reaches for
/// constantly, plus the fixed table ids of the bootstrap classes.
pub struct BootstrapRegistry {
    // Common method keys
    pub clinit_mk: MethodKey,
    pub no_arg_constructor_mk: MethodKey,
    pub string_constructor_mk: MethodKey,
    pub main_mk: MethodKey,
    pub run_mk: MethodKey,
    pub finalize_mk: MethodKey,

    // Common field keys
    pub class_name_fk: FieldKey,
    pub string_value_fk: FieldKey,
    pub string_offset_fk: FieldKey,
    pub string_count_fk: FieldKey,
    pub referent_fk: FieldKey,
    pub throwable_message_fk: FieldKey,

    // Common class names (interned)
    pub java_lang_object_sym: Symbol,
    pub java_lang_class_sym: Symbol,
    pub java_lang_string_sym: Symbol,
    pub java_lang_thread_sym: Symbol,
    pub java_lang_throwable_sym: Symbol,
    pub java_lang_ref_reference_sym: Symbol,
    pub java_lang_ref_weak_reference_sym: Symbol,
    pub char_array_sym: Symbol,

    // Common method names (interned)
    pub init_sym: Symbol,
    pub clinit_sym: Symbol,
    pub main_sym: Symbol,

    // Common descriptors (interned)
    pub void_desc: Symbol,
    pub string_desc: Symbol,
    pub object_desc: Symbol,
    pub string_array_desc: Symbol,
    pub char_array_desc: Symbol,
}

impl BootstrapRegistry {
    pub fn new(interner: &ThreadedRodeo) -> Self {
        let init_sym = interner.get_or_intern("<init>");
        let clinit_sym = interner.get_or_intern("<clinit>");
        let main_sym = interner.get_or_intern("main");

        let void_desc = interner.get_or_intern("()V");
        let string_desc = interner.get_or_intern("Ljava/lang/String;");
        let object_desc = interner.get_or_intern("Ljava/lang/Object;");
        let string_array_desc = interner.get_or_intern("[Ljava/lang/String;");
        let char_array_desc = interner.get_or_intern("[C");
        let int_desc = interner.get_or_intern("I");

        Self {
            clinit_mk: MethodKey {
                name: clinit_sym,
                desc: void_desc,
            },
            no_arg_constructor_mk: MethodKey {
                name: init_sym,
                desc: void_desc,
            },
            string_constructor_mk: MethodKey {
                name: init_sym,
                desc: interner.get_or_intern("(Ljava/lang/String;)V"),
            },
            main_mk: MethodKey {
                name: main_sym,
                desc: interner.get_or_intern("([Ljava/lang/String;)V"),
            },
            run_mk: MethodKey {
                name: interner.get_or_intern("run"),
                desc: void_desc,
            },
            finalize_mk: MethodKey {
                name: interner.get_or_intern("finalize"),
                desc: void_desc,
            },

            class_name_fk: FieldKey {
                name: interner.get_or_intern("name"),
                desc: string_desc,
            },
            string_value_fk: FieldKey {
                name: interner.get_or_intern("value"),
                desc: char_array_desc,
            },
            string_offset_fk: FieldKey {
                name: interner.get_or_intern("offset"),
                desc: int_desc,
            },
            string_count_fk: FieldKey {
                name: interner.get_or_intern("count"),
                desc: int_desc,
            },
            referent_fk: FieldKey {
                name: interner.get_or_intern("referent"),
                desc: object_desc,
            },
            throwable_message_fk: FieldKey {
                name: interner.get_or_intern("message"),
                desc: string_desc,
            },

            java_lang_object_sym: interner.get_or_intern("java/lang/Object"),
            java_lang_class_sym: interner.get_or_intern("java/lang/Class"),
            java_lang_string_sym: interner.get_or_intern("java/lang/String"),
            java_lang_thread_sym: interner.get_or_intern("java/lang/Thread"),
            java_lang_throwable_sym: interner.get_or_intern("java/lang/Throwable"),
            java_lang_ref_reference_sym: interner.get_or_intern("java/lang/ref/Reference"),
            java_lang_ref_weak_reference_sym: interner.get_or_intern("java/lang/ref/WeakReference"),
            char_array_sym: char_array_desc,

            init_sym,
            clinit_sym,
            main_sym,

            void_desc,
            string_desc,
            object_desc,
            string_array_desc,
            char_array_desc,
        }
    }

    // The bootstrap classes sit in fixed, well-known table slots assigned
    // at method-area construction, before anything is loaded.

    pub fn java_lang_object_id(&self) -> ClassId {
        ClassId::from_usize(1)
    }

    pub fn java_lang_string_id(&self) -> ClassId {
        ClassId::from_usize(2)
    }

    pub fn java_lang_class_id(&self) -> ClassId {
        ClassId::from_usize(3)
    }

    pub fn java_lang_thread_id(&self) -> ClassId {
        ClassId::from_usize(4)
    }
}
