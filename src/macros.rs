/// returns name of current function.
macro_rules! fn_name_bare {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        name.rsplit("::")
            .find(|&part| part != "f" && part != "{{closure}}")
            .unwrap_or(name)
    }};
}

/// returns name of current function plus "()"
macro_rules! fn_name {
    () => {{
        format!("{}()", $crate::macros::fn_name_bare!())
    }};
}

/// logs a debug line if scope duration exceeds a threshold.
/// See [crate::ScopeDurationLogger]
macro_rules! log_slow_scope {
    () => {
        let log_slow_scope_desc = $crate::macros::fn_name!();
        let _____x = $crate::ScopeDurationLogger::new_default_threshold(&log_slow_scope_desc);
    };
    ($description: expr) => {
        let log_slow_scope_desc = $description;
        let _____x = $crate::ScopeDurationLogger::new_default_threshold(&log_slow_scope_desc);
    };
    ($description: expr, $threshold: expr) => {
        let log_slow_scope_desc = $description;
        let _____x =
            $crate::ScopeDurationLogger::new_with_threshold(&log_slow_scope_desc, $threshold);
    };
}

/// logs the duration of the enclosing scope unconditionally.
/// See [crate::ScopeDurationLogger]
macro_rules! log_scope_duration {
    () => {
        let log_scope_desc = $crate::macros::fn_name!();
        let _____x = $crate::ScopeDurationLogger::new_without_threshold(&log_scope_desc);
    };
    ($description: expr) => {
        let log_scope_desc = $description;
        let _____x = $crate::ScopeDurationLogger::new_without_threshold(&log_scope_desc);
    };
}

// These allow the macros to be used as
// use crate::macros::xxxxx;
//
// see: https://stackoverflow.com/a/67140319/10087197
pub(crate) use fn_name;
pub(crate) use fn_name_bare;
#[allow(unused_imports)]
pub(crate) use log_scope_duration;
pub(crate) use log_slow_scope;
