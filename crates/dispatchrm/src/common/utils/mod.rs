pub mod controlflow;
