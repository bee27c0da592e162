pub mod helpers;
mod tests_prepare_commit;
