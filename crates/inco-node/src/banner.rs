/// Width of every banner row.
pub const BANNER_WIDTH: usize = 100;

pub const PRODUCT_NAME: &str = "INCO-NODE-APPLICATION";

const MARK: &[&str] = &[
    "          iiii                                                  ",
    "         i::::i                                                 ",
    "          iiii                                                  ",
    "        iiiiiii nnnn  nnnnnnnn        cccccccccccccccc   ooooooooooo   ",
    "        i:::::i n:::nn::::::::nn    cc:::::::::::::::c oo:::::::::::oo ",
    "         i::::i n::::::::::::::nn  c:::::::::::::::::co:::::::::::::::o",
    "         i::::i nn:::::::::::::::nc:::::::cccccc:::::co:::::ooooo:::::o",
    "         i::::i   n:::::nnnn:::::nc::::::c     ccccccco::::o     o::::o",
    "         i::::i   n::::n    n::::nc:::::c             o::::o     o::::o",
    "         i::::i   n::::n    n::::nc:::::c             o::::o     o::::o",
    "         i::::i   n::::n    n::::nc::::::c     ccccccco::::o     o::::o",
    "        i::::::i  n::::n    n::::nc:::::::cccccc:::::co:::::ooooo:::::o",
    "        i::::::i  n::::n    n::::n c:::::::::::::::::co:::::::::::::::o",
    "        i::::::i  n::::n    n::::n  cc:::::::::::::::c oo:::::::::::oo ",
    "        iiiiiiii  nnnnnn    nnnnnn    cccccccccccccccc   ooooooooooo   ",
];

/// Center `text` between `---` markers, padded with `M` to [`BANNER_WIDTH`].
/// Text too long to pad is returned with its markers only.
pub fn framed_label(text: &str) -> String {
    let label = format!("---{text}---");
    let padding = BANNER_WIDTH.saturating_sub(label.chars().count());
    let left = padding / 2;
    let right = padding - left;
    format!("{}{label}{}", "M".repeat(left), "M".repeat(right))
}

/// The `/inco` banner with the product name and `version` embedded.
pub fn banner(version: &str) -> String {
    let border = "M".repeat(BANNER_WIDTH);
    let mut out = String::new();
    out.push_str(&border);
    out.push('\n');
    for row in MARK {
        out.push_str(&format!("{row:^BANNER_WIDTH$}").trim_end());
        out.push('\n');
    }
    out.push_str(&framed_label(PRODUCT_NAME));
    out.push('\n');
    out.push_str(&framed_label(version));
    out.push('\n');
    out.push_str(&border);
    out.push('\n');
    out
}
