// Response body parsing for image block downloads.

pub mod multipart;
