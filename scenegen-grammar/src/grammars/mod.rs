//! Concrete scene grammars

pub mod dish_bin;
pub mod table_setting;
