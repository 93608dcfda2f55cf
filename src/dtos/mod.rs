pub mod jobdtos;
