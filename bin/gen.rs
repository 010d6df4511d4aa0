use clap::{Arg, ArgAction, Command};
use std::io::{self, Write};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// One amount in the style a spreadsheet export would use for row `i`.
fn amount(i: u64) -> String {
    let dollars = i % 50_000;
    let cents = i % 100;
    match i % 5 {
        0 => format!("\"${},{:03}.{cents:02}\"", dollars / 1000, dollars % 1000),
        1 => format!("({dollars}.{cents:02})"),
        2 => format!("{dollars}.{cents:02}"),
        3 => format!("=\"{dollars}\""),
        _ => format!("-{dollars}"),
    }
}

fn due(i: u64) -> String {
    let month = (i % 12) as usize + 1;
    let day = i % 28 + 1;
    match i % 3 {
        0 => format!("{month:02}/{day:02}/25"),
        1 => format!("2025-{month:02}-{day:02}"),
        _ => format!("{day:02}-{}-2025", MONTHS[month - 1]),
    }
}

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write a vendor payables CSV with the quirks of real exports to stdout")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("bom")
                .long("bom")
                .help("Start with a UTF-8 byte order mark")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("preamble")
                .long("preamble")
                .help("Report title lines above the header")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .arg(
            Arg::new("bad_every")
                .long("bad-every")
                .help("Make every Nth row invalid (0 = never)")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .arg(
            Arg::new("duplicate_every")
                .long("duplicate-every")
                .help("Repeat the previous vendor every Nth row (0 = never)")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .arg(Arg::new("delim").long("delim").default_value(","))
        .get_matches();

    let rows: u64 = *matches.get_one("rows").unwrap();
    let preamble: u64 = *matches.get_one("preamble").unwrap();
    let bad_every: u64 = *matches.get_one("bad_every").unwrap();
    let duplicate_every: u64 = *matches.get_one("duplicate_every").unwrap();
    let delim = matches.get_one::<String>("delim").unwrap();

    let mut out = io::BufWriter::new(io::stdout().lock());

    if matches.get_flag("bom") {
        out.write_all(b"\xEF\xBB\xBF")?;
    }
    for i in 0..preamble {
        match i {
            0 => writeln!(&mut out, "Vendor Payables Aging")?,
            1 => writeln!(&mut out, "Generated by gen")?,
            _ => writeln!(&mut out)?,
        }
    }
    writeln!(&mut out, "Vendor{delim}Amount{delim}Due{delim}Status")?;

    for i in 0..rows {
        let n = i + 1;
        let vendor_id = if duplicate_every > 0 && n % duplicate_every == 0 && i > 0 {
            i - 1
        } else {
            i
        };
        let vendor = format!("VENDOR-{vendor_id:08}");
        let status = if i % 2 == 0 { "Open" } else { "paid" };

        if bad_every > 0 && n % bad_every == 0 {
            // alternate between a non-numeric amount and a missing vendor
            if n / bad_every % 2 == 0 {
                writeln!(&mut out, "{vendor}{delim}n/a{delim}{}{delim}{status}", due(i))?;
            } else {
                writeln!(&mut out, "{delim}{}{delim}{}{delim}{status}", amount(i), due(i))?;
            }
        } else {
            writeln!(&mut out, "{vendor}{delim}{}{delim}{}{delim}{status}", amount(i), due(i))?;
        }
        if i % 10_000 == 0 {
            out.flush()?;
        } // keep buffers moving on huge runs
    }

    out.flush()?;
    Ok(())
}
