use anyhow::{bail, Context, Result};

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct BuildArgs {
    pub(crate) recipe: Option<String>,
    pub(crate) tag: Option<String>,
    pub(crate) keep_layers: bool,
}

pub(crate) fn parse_build_args(args: &[String]) -> Result<BuildArgs> {
    let mut parsed = BuildArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--tag" => {
                let Some(tag) = iter.next() else {
                    bail!("`--tag` expects a value\n\n{}", crate::usage());
                };
                parsed.tag = Some(tag.clone());
            }
            "--keep-layers" => parsed.keep_layers = true,
            flag if flag.starts_with("--") => {
                bail!("unknown flag '{}' for `build`\n\n{}", flag, crate::usage())
            }
            positional => {
                if parsed.recipe.is_some() {
                    bail!(
                        "unexpected argument '{}'; `build` takes at most one recipe path",
                        positional
                    );
                }
                parsed.recipe = Some(positional.to_string());
            }
        }
    }
    Ok(parsed)
}

pub(crate) fn parse_keep(raw: &str) -> Result<usize> {
    let keep: usize = raw
        .parse()
        .with_context(|| format!("invalid keep count '{}'", raw))?;
    if keep == 0 {
        bail!("keep count must be at least 1");
    }
    Ok(keep)
}
