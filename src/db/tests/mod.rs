mod helpers;
mod tests_crash;
mod tests_iterators;
mod tests_oracle;
