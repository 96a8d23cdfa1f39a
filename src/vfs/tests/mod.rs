mod tests_direct;
mod tests_std;
