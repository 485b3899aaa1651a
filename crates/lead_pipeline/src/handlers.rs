pub mod run;
pub mod trigger;
