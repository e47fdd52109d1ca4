mod commit_list;
mod fark;
mod helpers;
