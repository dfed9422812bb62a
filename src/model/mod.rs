pub mod comment;
pub mod history;
pub mod project;
pub mod tree;
pub mod work_item;
