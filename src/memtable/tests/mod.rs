mod tests_tombstones;
