use super::*;
use crate::ir::{DType, Metadata, Op};
use crate::shape::{shape_of, Variable};

fn parse(source: &str) -> GraphFile {
    match parse_graph(source, "test.tg") {
        Ok(file) => file,
        Err(diags) => panic!(
            "{}",
            diags
                .iter()
                .map(|d| d.to_text("test.tg", source))
                .collect::<String>()
        ),
    }
}

fn errors(source: &str) -> Vec<String> {
    parse_graph(source, "test.tg")
        .unwrap_err()
        .into_iter()
        .map(|d| d.message)
        .collect()
}

#[test]
fn test_lexer_tokens() {
    let (tokens, diags) = Lexer::new("a = pad x [0:n, 1:-2] # trailing\n\n\nb").tokenize();
    assert!(diags.is_empty());
    let kinds: Vec<Token> = tokens.into_iter().map(|t| t.node).collect();
    assert_eq!(
        kinds,
        vec![
            Token::Ident("a".into()),
            Token::Eq,
            Token::Ident("pad".into()),
            Token::Ident("x".into()),
            Token::LBracket,
            Token::Int(0),
            Token::Colon,
            Token::Ident("n".into()),
            Token::Comma,
            Token::Int(1),
            Token::Colon,
            Token::Int(-2),
            Token::RBracket,
            Token::Newline,
            Token::Ident("b".into()),
            Token::Eof,
        ]
    );
}

#[test]
fn test_lexer_numbers() {
    let (tokens, diags) = Lexer::new("2.5 -1e3 7 -inf").tokenize();
    assert!(diags.is_empty());
    let kinds: Vec<Token> = tokens.into_iter().map(|t| t.node).collect();
    assert_eq!(
        kinds,
        vec![
            Token::Float(2.5),
            Token::Float(-1000.0),
            Token::Int(7),
            Token::Float(f64::NEG_INFINITY),
            Token::Eof,
        ]
    );
}

#[test]
fn test_parse_reduction_graph() {
    let mut file = parse(
        "# row sums\n\
         a = buffer HOST:0 f32 16 arange\n\
         b = const HOST:0 f32 2.0 [16]\n\
         c = mul a b\n\
         d = reshape c [4, 4]\n\
         e = sum d [1]\n\
         out e\n",
    );
    assert_eq!(file.outputs.len(), 1);
    assert_eq!(file.outputs[0].name, "e");
    let e = file.outputs[0].node;
    assert_eq!(file.graph.op(e), Op::ReduceAxis);
    assert_eq!(file.graph.shape(e), Some(&shape_of(&[4, 1])[..]));
    assert_eq!(file.graph.dtype(e), DType::F32);

    assert_eq!(file.inits.len(), 1);
    assert_eq!(file.inits[0].fill, Fill::Arange);
    assert_eq!(file.graph.op(file.inits[0].node), Op::Buffer);
    assert_eq!(file.graph.device(file.inits[0].node), Some("HOST:0"));
    assert!(file.warnings.is_empty());

    let sink = file.sink();
    assert_eq!(file.graph.src(sink), &[e]);
}

#[test]
fn test_statements_are_labeled_with_lines() {
    let file = parse("a = buffer HOST f32 4\n\nb = exp2 a\nout b\n");
    let b = file.outputs[0].node;
    assert_eq!(file.graph.metadata(b), Some(&Metadata::new("exp2", "test.tg:3")));
    let a = file.graph.src(b)[0];
    assert_eq!(file.graph.metadata(a), None);
}

#[test]
fn test_every_op_parses() {
    let file = parse(
        "a = buffer HOST f32 6 fill 1.5\n\
         m = buffer HOST bool 6\n\
         b = neg a\n\
         c = max b a\n\
         d = where m c a\n\
         e = reshape d [2, 3]\n\
         f = permute e [1, 0]\n\
         g = flip f [0]\n\
         h = pad g [1:0, 0:1]\n\
         i = shrink h [1:4, 0:2]\n\
         j = rmax i [1]\n\
         k = expand j [3, 4]\n\
         l = contiguous k\n\
         n = detach l\n\
         o = fuse n\n\
         p = cast o i32\n\
         q = bitcast p f32\n\
         r = copy q CLANG\n\
         s = cmplt r r\n\
         t = recip r\n\
         u = sqrt t\n\
         v = log2 u\n\
         w = add v t\n\
         out w, s\n",
    );
    let g = &file.graph;
    assert_eq!(file.outputs.len(), 2);
    assert_eq!(file.inits[0].fill, Fill::Value(1.5));
    let w = file.outputs[0].node;
    assert_eq!(g.op(w), Op::Add);
    assert_eq!(g.shape(w), Some(&shape_of(&[3, 4])[..]));
    assert_eq!(g.device(w), Some("CLANG"));
    assert_eq!(g.dtype(file.outputs[1].node), DType::Bool);
    assert!(file.warnings.is_empty());
}

#[test]
fn test_variables_bind_dimensions() {
    let file = parse(
        "n = var 1 8 5\n\
         a = buffer HOST f32 8\n\
         b = shrink a [0:n]\n\
         out b\n",
    );
    let n = Variable::new("n", 1, 8);
    assert_eq!(file.var_vals.get(&n), Some(&5));
    let b = file.outputs[0].node;
    let shape = file.graph.shape(b).unwrap();
    assert_eq!(shape.len(), 1);
    assert!(!shape[0].is_const());
    assert_eq!(shape[0].eval(&file.var_vals), Ok(5));
    let mut other = file.var_vals.clone();
    other.insert(n, 3);
    assert_eq!(shape[0].eval(&other), Ok(3));
}

#[test]
fn test_unused_tensor_warns() {
    let file = parse("a = buffer HOST f32 4\nb = neg a\nc = exp2 a\nout b\n");
    assert_eq!(file.warnings.len(), 1);
    assert_eq!(file.warnings[0].message, "'c' is never used");
}

#[test]
fn test_unknown_op() {
    assert_eq!(
        errors("a = buffer HOST f32 4\nb = frobnicate a\nout a\n"),
        vec!["unknown op 'frobnicate'"]
    );
}

#[test]
fn test_errors_on_several_lines_are_all_reported() {
    let errs = errors(
        "a = buffer HOST f32 4\n\
         b = neg zz\n\
         c = reshape a [3]\n\
         d = cast a f128\n\
         a = neg a\n\
         out a\n",
    );
    assert_eq!(errs.len(), 4, "{:?}", errs);
    assert_eq!(errs[0], "undefined name 'zz'");
    assert!(errs[1].contains("reshape"), "{}", errs[1]);
    assert_eq!(errs[2], "unknown dtype 'f128'");
    assert_eq!(errs[3], "'a' is already defined");
}

#[test]
fn test_shape_errors_point_at_the_statement() {
    let source = "a = buffer HOST f32 4\nb = buffer HOST f32 5\nc = add a b\nout c\n";
    let diags = parse_graph(source, "test.tg").unwrap_err();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].span.line(source), 3);
}

#[test]
fn test_failed_statements_do_not_cascade() {
    let errs = errors(
        "n = var 1 4 9\n\
         a = buffer HOST f32 4\n\
         b = buffer HOST f32 5\n\
         c = add a b\n\
         d = neg c\n\
         e = reshape a [n]\n\
         out d, e\n",
    );
    assert_eq!(errs.len(), 2, "{:?}", errs);
    assert_eq!(errs[0], "n = 9 is outside [1, 4]");
    assert!(errs[1].contains("add"), "{}", errs[1]);
}

#[test]
fn test_missing_outputs() {
    assert_eq!(errors("a = buffer HOST f32 4\n"), vec!["graph has no outputs"]);
}

#[test]
fn test_trailing_tokens() {
    assert_eq!(
        errors("a = buffer HOST f32 4\nb = neg a a\nout a\n"),
        vec!["expected end of line, found 'a'"]
    );
}

#[test]
fn test_variable_out_of_range() {
    assert_eq!(
        errors("n = var 1 4 9\na = buffer HOST f32 4\nout a\n"),
        vec!["n = 9 is outside [1, 4]"]
    );
}

#[test]
fn test_lexer_error_is_reported() {
    assert_eq!(
        errors("a = buffer HOST f32 4\nout a\n$\n"),
        vec!["unexpected character '$'"]
    );
}
