/*
Integration tests live in this directory rather than under tests/ at the crate root:

1) For speed (no separate linking per test binary)
2) For access to crate internals
3) So the library is compiled with cfg(test) once, not once per external test binary

See: https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
*/

mod common;

mod backend_conn_test;
mod ensure_database_not_connected_test;
mod pool_test;
mod readiness_test;
mod sysconn_test;
