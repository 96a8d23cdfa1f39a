mod helpers;
mod tests_edit;
