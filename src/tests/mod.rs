mod fixtures;
mod runner;
