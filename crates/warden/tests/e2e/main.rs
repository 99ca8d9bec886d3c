mod helpers;
mod test_coroutines;
mod test_host;
mod test_language;
mod test_limits;
mod test_stdlib;
mod test_tables;
