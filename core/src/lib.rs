pub mod api;
pub mod builtins;
pub mod bytecode;
pub mod cell_table;
pub mod heap;
pub mod objects;
pub mod table;
pub mod value;
pub mod vm;
