pub mod sup;
