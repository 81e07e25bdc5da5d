//! Collector configuration.
//!
//! Options are typed, validated, and can be set from environment variables
//! (prefix `MAGPIE_`) or from a bulk `key=value` command-line string.

use std::default::Default;
use std::fmt::Debug;

fn always_valid<T>(_: &T) -> bool {
    true
}

/// A collector option of a given type.
/// This type stores some metadata for the option. To get the value of an
/// option, simply dereference it (for example, `*options.threads`).
#[derive(Clone)]
pub struct GcOption<T: Debug + Clone> {
    /// The actual value for the option
    value: T,
    /// The validator to ensure the value is valid.
    validator: fn(&T) -> bool,
    /// Can we set this option through env vars?
    from_env_var: bool,
    /// Can we set this option through command line options/API?
    from_command_line: bool,
}

impl<T: Debug + Clone> GcOption<T> {
    pub fn new(
        value: T,
        validator: fn(&T) -> bool,
        from_env_var: bool,
        from_command_line: bool,
    ) -> Self {
        GcOption {
            value,
            validator,
            from_env_var,
            from_command_line,
        }
    }

    /// Set the option to the given value. Returns true if the value is valid,
    /// and we set the option to the value.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

// Dereference an option to get its value.
impl<T: Debug + Clone> std::ops::Deref for GcOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

macro_rules! options {
    // Verify whether we can set an option through env var or command line.
    (@verify_set_from($self: expr, $key: expr, $verify_field: ident, $($name: ident),*)) => {
        match $key {
            $(stringify!($name) => { assert!($self.$name.$verify_field, "cannot set option {} (not {})", $key, stringify!($verify_field)) }),*
            _ => panic!("Invalid Options key: {}", $key)
        }
    };

    ($($name:ident: $type:ty[env_var: $env_var:expr, command_line: $command_line:expr][$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[env_var: $env_var, command_line: $command_line][$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[env_var: $env_var:expr, command_line: $command_line:expr][$validator:expr] = $default:expr),*) => [
        /// The set of recognized collector options.
        #[derive(Clone)]
        pub struct Options {
            $(pub $name: GcOption<$type>),*
        }
        impl Options {
            /// Set an option from env var
            pub fn set_from_env_var(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_env_var, $($name),*));
                self.set_inner(s, val)
            }

            /// Set an option from command line
            pub fn set_from_command_line(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_command_line, $($name),*));
                self.set_inner(s, val)
            }

            /// Bulk process options. Returns true if all the options are
            /// processed successfully. This method returns false if the option
            /// string is invalid, or if it includes any invalid option.
            ///
            /// Arguments:
            /// * `options`: a string of key-value pairs separated by white
            ///   spaces or commas, e.g. `threads=1 compact=false`, or
            ///   `threads=1,compact=false`
            pub fn set_bulk_from_command_line(&mut self, options: &str) -> bool {
                for opt in options.replace(',', " ").split_ascii_whitespace() {
                    let kv_pair: Vec<&str> = opt.split('=').collect();
                    if kv_pair.len() != 2 {
                        return false;
                    }

                    let key = kv_pair[0];
                    let val = kv_pair[1];
                    if !self.set_from_command_line(key, val) {
                        return false;
                    }
                }

                true
            }

            /// Set an option and run its validator for its value.
            fn set_inner(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling process()) to the right type
                    $(stringify!($name) => if let Ok(typed_val) = val.parse::<$type>() {
                        let is_set = self.$name.set(typed_val);
                        if !is_set {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_set
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Can't parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }

            /// Create an `Options` instance with built-in default settings.
            fn new() -> Self {
                Options {
                    $($name: GcOption::new($default, $validator, $env_var, $command_line)),*
                }
            }

            /// Read options from environment variables, and apply those
            /// settings to self.
            ///
            /// If we have environment variables that start with `MAGPIE_` and
            /// match any option (such as `MAGPIE_THREADS`), we set the option
            /// to its value (if it is a valid value).
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "MAGPIE_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_from_env_var(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }
        }

        impl Default for Options {
            /// By default, `Options` instance is created with built-in default settings.
            fn default() -> Self {
                Self::new()
            }
        }
    ]
}

options! {
    // Number of GC worker threads.
    threads:               usize [env_var: true, command_line: true] [|v: &usize| *v > 0] = num_cpus::get(),
    // Master switch for compaction. When off, full GCs mark and sweep only.
    compact:               bool  [env_var: true, command_line: true] [always_valid] = true,
    // Consider code-space pages as evacuation candidates.
    compact_code_space:    bool  [env_var: true, command_line: true] [always_valid] = true,
    // Consider map-space pages as evacuation candidates.
    compact_maps:          bool  [env_var: true, command_line: true] [always_valid] = false,
    // Allow compaction while a mutator stack that may refer into the heap is present.
    compact_with_stack:    bool  [env_var: true, command_line: true] [always_valid] = true,
    // Allow code-space compaction while such a stack is present.
    compact_code_space_with_stack: bool [env_var: true, command_line: true] [always_valid] = true,
    // Force candidate selection on every full GC regardless of fragmentation.
    compact_on_every_full_gc: bool [env_var: true, command_line: true] [always_valid] = false,
    // Testing mode: select every other page as a candidate.
    stress_compaction:     bool  [env_var: true, command_line: true] [always_valid] = false,
    // Testing mode: select a random sample of pages as candidates.
    stress_compaction_random: bool [env_var: true, command_line: true] [always_valid] = false,
    // Testing mode: only pages pre-flagged by the embedder become candidates.
    manual_evacuation_candidates_selection: bool [env_var: true, command_line: true] [always_valid] = false,
    // Experiment: disable compaction when memory reduction is requested.
    gc_experiment_less_compaction: bool [env_var: true, command_line: true] [always_valid] = false,
    // Treat every full GC as memory-reducing (fixed candidate thresholds).
    reduce_memory:         bool  [env_var: true, command_line: true] [always_valid] = false,
    // Parallelism toggles.
    parallel_compaction:   bool  [env_var: true, command_line: true] [always_valid] = true,
    parallel_marking:      bool  [env_var: true, command_line: true] [always_valid] = true,
    parallel_pointer_update: bool [env_var: true, command_line: true] [always_valid] = true,
    // Recognized for the incremental/concurrent marker collaborator; the
    // full collector only consumes its residual worklists.
    concurrent_marking:    bool  [env_var: true, command_line: true] [always_valid] = false,
    // Sweep released pages on a background thread after StartSweepSpaces.
    concurrent_sweeping:   bool  [env_var: true, command_line: true] [always_valid] = false,
    // Background baseline-code publication takes the page mutex for typed
    // slot insertion when this is on.
    concurrent_sparkplug:  bool  [env_var: true, command_line: true] [always_valid] = false,
    // Rounds of the ephemeron fixpoint before falling back to the linear algorithm.
    ephemeron_fixpoint_iterations: usize [env_var: true, command_line: true] [|v: &usize| *v > 0] = 10,
    // Young-generation mark-compact toggles.
    minor_mc:              bool  [env_var: true, command_line: true] [always_valid] = true,
    minor_mc_sweeping:     bool  [env_var: true, command_line: true] [always_valid] = false,
    minor_mc_trace_fragmentation: bool [env_var: true, command_line: true] [always_valid] = false,
    // Code flushing gates.
    flush_bytecode:        bool  [env_var: true, command_line: true] [always_valid] = true,
    flush_baseline_code:   bool  [env_var: true, command_line: true] [always_valid] = false,
    // Number of full GCs a bytecode array must survive unexecuted before it
    // may be flushed.
    bytecode_old_age:      usize [env_var: true, command_line: true] [|v: &usize| *v > 0] = 2,
    // Whole-page promotion of nursery pages.
    page_promotion:        bool  [env_var: true, command_line: true] [always_valid] = true,
    // Percentage of live bytes on a nursery page to enable whole-page promotion.
    page_promotion_threshold: usize [env_var: true, command_line: true] [|v: &usize| *v > 0 && *v <= 100] = 70,
    // Escalate an aborted old-to-old evacuation to a fatal error.
    crash_on_aborted_evacuation: bool [env_var: true, command_line: true] [always_valid] = false,
    // Diagnostic outputs only.
    trace_gc:              bool  [env_var: true, command_line: true] [always_valid] = false,
    trace_evacuation:      bool  [env_var: true, command_line: true] [always_valid] = false,
    trace_evacuation_candidates: bool [env_var: true, command_line: true] [always_valid] = false,
    trace_fragmentation:   bool  [env_var: true, command_line: true] [always_valid] = false,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let mut options = Options::default();
            options.read_env_var_settings();
            assert_eq!(*options.ephemeron_fixpoint_iterations, 10);
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("MAGPIE_EPHEMERON_FIXPOINT_ITERATIONS", "4");

                    let mut options = Options::default();
                    options.read_env_var_settings();
                    assert_eq!(*options.ephemeron_fixpoint_iterations, 4);
                },
                || {
                    std::env::remove_var("MAGPIE_EPHEMERON_FIXPOINT_ITERATIONS");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // We cannot parse the value, so use the default value.
                    std::env::set_var("MAGPIE_THREADS", "abc");

                    let mut options = Options::default();
                    options.read_env_var_settings();
                    assert_eq!(*options.threads, num_cpus::get());
                },
                || {
                    std::env::remove_var("MAGPIE_THREADS");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_key() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("MAGPIE_ABC", "42");

                    let mut options = Options::default();
                    options.read_env_var_settings();
                    assert_eq!(*options.threads, num_cpus::get());
                },
                || {
                    std::env::remove_var("MAGPIE_ABC");
                },
            )
        })
    }

    #[test]
    fn ignore_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("MAGPIE_PAGE_PROMOTION_THRESHOLD", "42");

                    let options = Options::default();
                    // Not calling read_env_var_settings here.
                    assert_eq!(*options.page_promotion_threshold, 70);
                },
                || {
                    std::env::remove_var("MAGPIE_PAGE_PROMOTION_THRESHOLD");
                },
            )
        })
    }

    #[test]
    fn test_bulk_command_line() {
        serial_test(|| {
            let mut options = Options::default();
            let success = options.set_bulk_from_command_line("compact=false threads=3");
            assert!(success);
            assert!(!*options.compact);
            assert_eq!(*options.threads, 3);
        })
    }

    #[test]
    fn test_bulk_command_line_rejects_invalid_value() {
        serial_test(|| {
            let mut options = Options::default();
            // A validator rejects zero threads; the bulk call reports failure.
            let success = options.set_bulk_from_command_line("threads=0");
            assert!(!success);
            assert_eq!(*options.threads, num_cpus::get());
        })
    }
}
