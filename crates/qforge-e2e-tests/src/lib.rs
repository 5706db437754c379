//! End-to-end tests for qforge live under `tests/`.
