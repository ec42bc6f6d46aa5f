//! Scenario suite shared by every offload backend. Each scenario drives a
//! guard end to end against the backend under test, so a backend passes
//! exactly when a caller could not tell it from the sequential
//! interpreter. Backend crates invoke [`define_backend_tests`] with a
//! constructor to stamp the whole suite into their own test target.

pub mod harness;
pub mod parity;
pub mod smoke;

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use $crate::{parity, smoke};

            #[test]
            fn smoke_saxpy_offloads_and_matches_the_host() {
                let backend = ($backend_ctor)();
                smoke::saxpy_offloads_and_matches_the_host(&backend);
            }

            #[test]
            fn smoke_small_trip_counts_stay_sequential() {
                let backend = ($backend_ctor)();
                smoke::small_trip_counts_stay_sequential(&backend);
            }

            #[test]
            fn smoke_loop_carried_recurrences_never_offload() {
                let backend = ($backend_ctor)();
                smoke::loop_carried_recurrences_never_offload(&backend);
            }

            #[test]
            fn smoke_nested_fills_fuse_and_offload() {
                let backend = ($backend_ctor)();
                smoke::nested_fills_fuse_and_offload(&backend);
            }

            #[test]
            fn smoke_aliased_outputs_fall_back_to_the_host() {
                let backend = ($backend_ctor)();
                smoke::aliased_outputs_fall_back_to_the_host(&backend);
            }

            #[test]
            fn smoke_out_of_range_gathers_fail_without_mutation() {
                let backend = ($backend_ctor)();
                smoke::out_of_range_gathers_fail_without_mutation(&backend);
            }

            #[test]
            fn smoke_integer_overflow_is_sticky() {
                let backend = ($backend_ctor)();
                smoke::integer_overflow_is_sticky(&backend);
            }

            #[test]
            fn smoke_reductions_match_the_sequential_fold() {
                let backend = ($backend_ctor)();
                smoke::reductions_match_the_sequential_fold(&backend);
            }

            #[test]
            fn smoke_kernels_are_reused_across_calls() {
                let backend = ($backend_ctor)();
                smoke::kernels_are_reused_across_calls(&backend);
            }

            #[test]
            fn smoke_background_preparation_reaches_ready() {
                let backend = ($backend_ctor)();
                smoke::background_preparation_reaches_ready(&backend);
            }

            #[test]
            fn parity_randomized_affine_nests_match_the_host() {
                let backend = ($backend_ctor)();
                parity::randomized_affine_nests_match_the_host(&backend);
            }

            #[test]
            fn parity_randomized_grid_stencils_match_the_host() {
                let backend = ($backend_ctor)();
                parity::randomized_grid_stencils_match_the_host(&backend);
            }

            #[test]
            fn parity_randomized_gathers_match_the_host() {
                let backend = ($backend_ctor)();
                parity::randomized_gathers_match_the_host(&backend);
            }

            #[test]
            fn parity_randomized_reductions_match_the_host() {
                let backend = ($backend_ctor)();
                parity::randomized_reductions_match_the_host(&backend);
            }

            #[test]
            fn parity_randomized_math_bodies_match_the_host() {
                let backend = ($backend_ctor)();
                parity::randomized_math_bodies_match_the_host(&backend);
            }
        }
    };
}
