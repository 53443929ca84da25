pub mod detect;
pub mod parser;
pub mod storage;
pub mod store;
pub mod validator;
pub mod writer;
